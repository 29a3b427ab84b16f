//! Dependency caches.
//!
//! A cache holds the source of packages named in `Uses` clauses. Caches are
//! searched when a project is loaded; the writable project cache (rooted at
//! the project's `.pgpkg` directory) is also the target of `pgpkg import`.

use std::fs;
use std::path::PathBuf;

use tracing::info;

use crate::config::CONFIG_FILENAME;
use crate::error::{PkgError, Result};
use crate::package::Package;
use crate::project::Project;
use crate::source::{DirSource, Source};

/// A searchable store of package sources, keyed by package name.
pub trait Cache: Send + Sync {
    /// Look up a package. `Ok(None)` means the cache does not hold it.
    fn get(&self, pkg_name: &str) -> Result<Option<Box<dyn Source>>>;

    /// Where this cache lives, for error messages.
    fn location(&self) -> String;
}

/// The cache attached to a package source: writable for directory sources,
/// read-only for archives.
pub enum SourceCache {
    /// A read-only cache (e.g. the `.pgpkg` subtree of an archive).
    Read(ReadCache),
    /// A read/write cache rooted at a directory.
    Write(WriteCache),
}

/// A read-only cache over any [`Source`]. The layout is one subdirectory
/// per package name, with `pgpkg.toml` as the membership marker.
pub struct ReadCache {
    root: Box<dyn Source>,
}

impl ReadCache {
    /// Wrap a source as a cache.
    pub fn new(root: Box<dyn Source>) -> Self {
        ReadCache { root }
    }
}

impl Cache for ReadCache {
    fn get(&self, pkg_name: &str) -> Result<Option<Box<dyn Source>>> {
        let pkg = self.root.sub(pkg_name)?;
        if pkg.exists(CONFIG_FILENAME) {
            Ok(Some(pkg))
        } else {
            Ok(None)
        }
    }

    fn location(&self) -> String {
        self.root.location()
    }
}

/// A writable cache rooted at a directory, typically `<project>/.pgpkg`.
pub struct WriteCache {
    dir: PathBuf,
}

impl WriteCache {
    /// Create a cache handle. The directory is created on first import.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        WriteCache { dir: dir.into() }
    }

    /// A read-only view of this cache, for use as a search cache.
    pub fn reader(&self) -> ReadCache {
        ReadCache::new(Box::new(DirSource::new(self.dir.clone())))
    }

    /// Delete a package from the cache.
    pub fn remove_package(&self, pkg_name: &str) -> Result<()> {
        let target = self.dir.join(pkg_name);
        if target.exists() {
            fs::remove_dir_all(&target)
                .map_err(|e| PkgError::from(e).at_location(target.display().to_string()))?;
        }
        Ok(())
    }

    /// Copy a single package into the cache: its canonical config plus
    /// every source file, reproduced verbatim.
    ///
    /// A dependency that is already cached is left alone, since replacing
    /// it could silently downgrade the project. A directly imported package
    /// always replaces any cached copy.
    pub fn import_package(&self, pkg: &Package) -> Result<()> {
        let target = self.dir.join(&pkg.name);

        if pkg.is_dependency && target.exists() {
            info!("dependency {} already imported, skipping", pkg.name);
            return Ok(());
        }

        self.remove_package(&pkg.name)?;
        fs::create_dir_all(&target)
            .map_err(|e| PkgError::from(e).at_location(target.display().to_string()))?;

        let config = pkg.export_config();
        fs::write(target.join(CONFIG_FILENAME), config.to_toml()?)
            .map_err(|e| PkgError::from(e).at_location(target.display().to_string()))?;

        for path in pkg.file_paths() {
            let bytes = pkg.source.read(&path)?;
            let dest = target.join(&path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| PkgError::from(e).at_location(parent.display().to_string()))?;
            }
            fs::write(&dest, bytes)
                .map_err(|e| PkgError::from(e).at_location(dest.display().to_string()))?;
        }

        Ok(())
    }

    /// Import every package of `project` (except the bootstrap package,
    /// which is never exported) into this cache.
    pub fn import_project(&self, project: &mut Project) -> Result<()> {
        project.resolve_dependencies()?;

        for pkg in project.packages() {
            if pkg.bootstrap {
                continue;
            }
            self.import_package(pkg)?;
        }

        Ok(())
    }
}

impl Cache for WriteCache {
    fn get(&self, pkg_name: &str) -> Result<Option<Box<dyn Source>>> {
        self.reader().get(pkg_name)
    }

    fn location(&self) -> String {
        self.dir.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_cache_requires_marker() {
        let dir = tempfile::tempdir().unwrap();
        let pkg_dir = dir.path().join("example.com/common");
        fs::create_dir_all(&pkg_dir).unwrap();
        fs::write(
            pkg_dir.join("pgpkg.toml"),
            "Package = \"example.com/common\"\nSchemas = [\"common\"]\n",
        )
        .unwrap();
        fs::create_dir_all(dir.path().join("example.com/empty")).unwrap();

        let cache = ReadCache::new(Box::new(DirSource::new(dir.path())));
        assert!(cache.get("example.com/common").unwrap().is_some());
        assert!(cache.get("example.com/empty").unwrap().is_none());
        assert!(cache.get("example.com/absent").unwrap().is_none());
    }

    #[test]
    fn write_cache_round_trips_through_reader() {
        let dir = tempfile::tempdir().unwrap();
        let cache = WriteCache::new(dir.path());
        assert!(cache.get("example.com/common").unwrap().is_none());

        let pkg_dir = dir.path().join("example.com/common");
        fs::create_dir_all(&pkg_dir).unwrap();
        fs::write(
            pkg_dir.join("pgpkg.toml"),
            "Package = \"example.com/common\"\nSchemas = [\"common\"]\n",
        )
        .unwrap();
        assert!(cache.get("example.com/common").unwrap().is_some());

        cache.remove_package("example.com/common").unwrap();
        assert!(cache.get("example.com/common").unwrap().is_none());
    }
}
