//! Package sources.
//!
//! A [`Source`] is a read-only tree of files that a package (or a cache of
//! packages) is loaded from. Three backings exist: a directory on disk, a
//! ZIP archive held in memory, and a static bundle compiled into the binary
//! (used for the bootstrap package). The engine only ever sees the trait.

use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use zip::ZipArchive;

use crate::cache::{ReadCache, SourceCache, WriteCache};
use crate::error::{ErrorKind, PkgError, Result};

/// Conventional name of the dependency cache directory inside a project.
pub const CACHE_DIR: &str = ".pgpkg";

/// A read-only tree of files.
pub trait Source: Send + Sync {
    /// Where this source came from, for error messages.
    fn location(&self) -> String;

    /// Read a file, addressed by a `/`-separated path relative to the
    /// source root.
    fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// True if `path` exists in this source.
    fn exists(&self, path: &str) -> bool;

    /// A source rooted at a subdirectory of this one.
    fn sub(&self, dir: &str) -> Result<Box<dyn Source>>;

    /// Visit every file under the source root, in a stable order. Paths are
    /// `/`-separated and relative to the root.
    fn walk(&self, cb: &mut dyn FnMut(&str) -> Result<()>) -> Result<()>;

    /// The dependency cache attached to this source, if it can have one.
    /// Directory sources yield a writable cache rooted at `.pgpkg`; archive
    /// sources yield a read-only view of the same subtree.
    fn cache(&self) -> Result<Option<SourceCache>> {
        Ok(None)
    }
}

/// Read a file as UTF-8 text.
pub fn read_string(source: &dyn Source, path: &str) -> Result<String> {
    let bytes = source.read(path)?;
    String::from_utf8(bytes).map_err(|e| {
        PkgError::new(ErrorKind::Io, format!("{} is not valid utf-8", path))
            .at_location(source.location())
            .with_source(e)
    })
}

/// Open a source from a filesystem path. Paths ending in `.zip` are read
/// into memory as archives; anything else is treated as a directory.
pub fn open_path(path: &str) -> Result<Box<dyn Source>> {
    if path.ends_with(".zip") {
        let bytes = fs::read(path)
            .map_err(|e| PkgError::from(e).at_location(path.to_string()))?;
        Ok(Box::new(ZipByteSource::new(bytes, path)?))
    } else {
        Ok(Box::new(DirSource::new(path)))
    }
}

fn join(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), path)
    }
}

/// A source backed by a directory on the local filesystem.
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    /// Create a source rooted at `root`. The directory is not checked until
    /// first access.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirSource { root: root.into() }
    }

    fn walk_dir(&self, dir: &Path, rel: &str, cb: &mut dyn FnMut(&str) -> Result<()>) -> Result<()> {
        let mut entries: Vec<_> = fs::read_dir(dir)
            .map_err(|e| PkgError::from(e).at_location(dir.display().to_string()))?
            .collect::<std::io::Result<_>>()
            .map_err(|e| PkgError::from(e).at_location(dir.display().to_string()))?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            let child = join(rel, &name);
            let ty = entry.file_type()?;
            if ty.is_dir() {
                self.walk_dir(&entry.path(), &child, cb)?;
            } else if ty.is_file() {
                cb(&child)?;
            }
        }
        Ok(())
    }
}

impl Source for DirSource {
    fn location(&self) -> String {
        self.root.display().to_string()
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        fs::read(self.root.join(path))
            .map_err(|e| PkgError::from(e).at_location(join(&self.location(), path)))
    }

    fn exists(&self, path: &str) -> bool {
        self.root.join(path).is_file()
    }

    fn sub(&self, dir: &str) -> Result<Box<dyn Source>> {
        Ok(Box::new(DirSource::new(self.root.join(dir))))
    }

    fn walk(&self, cb: &mut dyn FnMut(&str) -> Result<()>) -> Result<()> {
        let root = self.root.clone();
        self.walk_dir(&root, "", cb)
    }

    fn cache(&self) -> Result<Option<SourceCache>> {
        Ok(Some(SourceCache::Write(WriteCache::new(
            self.root.join(CACHE_DIR),
        ))))
    }
}

/// A source backed by a ZIP archive held in memory. Subtrees share the
/// archive and address it through a path prefix.
pub struct ZipByteSource {
    archive: Arc<Mutex<ZipArchive<Cursor<Vec<u8>>>>>,
    prefix: String,
    location: String,
}

impl ZipByteSource {
    /// Read a ZIP archive from bytes.
    pub fn new(bytes: Vec<u8>, location: &str) -> Result<Self> {
        let archive = ZipArchive::new(Cursor::new(bytes)).map_err(|e| {
            PkgError::new(ErrorKind::Io, "unable to read ZIP data")
                .at_location(location.to_string())
                .with_source(e)
        })?;
        Ok(ZipByteSource {
            archive: Arc::new(Mutex::new(archive)),
            prefix: String::new(),
            location: location.to_string(),
        })
    }

    fn full(&self, path: &str) -> String {
        join(&self.prefix, path)
    }
}

impl Source for ZipByteSource {
    fn location(&self) -> String {
        if self.prefix.is_empty() {
            self.location.clone()
        } else {
            format!("{}/{}", self.location, self.prefix)
        }
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.full(path);
        let mut archive = self.archive.lock().expect("zip archive lock poisoned");
        let mut file = archive.by_name(&full).map_err(|e| {
            PkgError::new(ErrorKind::Io, format!("unable to open {}", full))
                .at_location(self.location.clone())
                .with_source(e)
        })?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    fn exists(&self, path: &str) -> bool {
        let full = self.full(path);
        let archive = self.archive.lock().expect("zip archive lock poisoned");
        archive.file_names().any(|n| n == full)
    }

    fn sub(&self, dir: &str) -> Result<Box<dyn Source>> {
        Ok(Box::new(ZipByteSource {
            archive: Arc::clone(&self.archive),
            prefix: self.full(dir),
            location: self.location.clone(),
        }))
    }

    fn walk(&self, cb: &mut dyn FnMut(&str) -> Result<()>) -> Result<()> {
        let names: Vec<String> = {
            let archive = self.archive.lock().expect("zip archive lock poisoned");
            let mut names: Vec<String> = archive
                .file_names()
                .filter(|n| !n.ends_with('/'))
                .filter_map(|n| {
                    if self.prefix.is_empty() {
                        Some(n.to_string())
                    } else {
                        n.strip_prefix(&format!("{}/", self.prefix))
                            .map(|s| s.to_string())
                    }
                })
                .collect();
            names.sort();
            names
        };
        for name in &names {
            cb(name)?;
        }
        Ok(())
    }

    fn cache(&self) -> Result<Option<SourceCache>> {
        let marker = format!("{}/", self.full(CACHE_DIR));
        let has_cache = {
            let archive = self.archive.lock().expect("zip archive lock poisoned");
            archive.file_names().any(|n| n.starts_with(&marker))
        };
        if has_cache {
            Ok(Some(SourceCache::Read(ReadCache::new(self.sub(CACHE_DIR)?))))
        } else {
            Ok(None)
        }
    }
}

/// A source over a table of files compiled into the binary. Used for the
/// embedded bootstrap package.
pub struct StaticSource {
    files: &'static [(&'static str, &'static str)],
    prefix: String,
    location: &'static str,
}

impl StaticSource {
    /// Wrap a static file table. Paths are `/`-separated.
    pub fn new(location: &'static str, files: &'static [(&'static str, &'static str)]) -> Self {
        StaticSource {
            files,
            prefix: String::new(),
            location,
        }
    }

    fn full(&self, path: &str) -> String {
        join(&self.prefix, path)
    }
}

impl Source for StaticSource {
    fn location(&self) -> String {
        if self.prefix.is_empty() {
            self.location.to_string()
        } else {
            format!("{}/{}", self.location, self.prefix)
        }
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.full(path);
        self.files
            .iter()
            .find(|(name, _)| *name == full)
            .map(|(_, body)| body.as_bytes().to_vec())
            .ok_or_else(|| {
                PkgError::new(ErrorKind::Io, format!("unable to open {}", full))
                    .at_location(self.location.to_string())
            })
    }

    fn exists(&self, path: &str) -> bool {
        let full = self.full(path);
        self.files.iter().any(|(name, _)| *name == full)
    }

    fn sub(&self, dir: &str) -> Result<Box<dyn Source>> {
        Ok(Box::new(StaticSource {
            files: self.files,
            prefix: self.full(dir),
            location: self.location,
        }))
    }

    fn walk(&self, cb: &mut dyn FnMut(&str) -> Result<()>) -> Result<()> {
        let mut names: Vec<&str> = self
            .files
            .iter()
            .filter_map(|(name, _)| {
                if self.prefix.is_empty() {
                    Some(*name)
                } else {
                    name.strip_prefix(&format!("{}/", self.prefix))
                }
            })
            .collect();
        names.sort();
        for name in names {
            cb(name)?;
        }
        Ok(())
    }
}
