//! Project export.
//!
//! `pgpkg export` emits a ZIP archive of a project: the primary package at
//! the archive root, and each dependency under `.pgpkg/<name>/`, which is
//! exactly the shape [`crate::source::ZipByteSource`] and the cache layer
//! expect when the archive is installed or imported later.

use std::io::{Seek, Write};

use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::config::CONFIG_FILENAME;
use crate::error::{ErrorKind, PkgError, Result};
use crate::package::Package;
use crate::project::Project;
use crate::source::CACHE_DIR;

fn zip_error(e: zip::result::ZipError, what: &str) -> PkgError {
    PkgError::new(ErrorKind::Io, format!("unable to write {}", what)).with_source(e)
}

fn write_package<W: Write + Seek>(
    writer: &mut ZipWriter<W>,
    pkg: &Package,
    base: &str,
) -> Result<()> {
    let prefix = |path: &str| {
        if base.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", base, path)
        }
    };

    let options = SimpleFileOptions::default();

    let config_path = prefix(CONFIG_FILENAME);
    writer
        .start_file(&config_path, options)
        .map_err(|e| zip_error(e, &config_path))?;
    writer.write_all(pkg.export_config().to_toml()?.as_bytes())?;

    for path in pkg.file_paths() {
        let bytes = pkg.source.read(&path)?;
        let dest = prefix(&path);
        writer
            .start_file(&dest, options)
            .map_err(|e| zip_error(e, &dest))?;
        writer.write_all(&bytes)?;
    }

    Ok(())
}

/// Write a project to a ZIP archive: the primary package at the root, its
/// dependencies under the cache directory. The bootstrap package is never
/// exported.
pub fn write_project<W: Write + Seek>(
    writer: &mut ZipWriter<W>,
    project: &mut Project,
) -> Result<()> {
    project.resolve_dependencies()?;

    let mut main_found = false;
    for pkg in project.packages() {
        if pkg.bootstrap {
            continue;
        }

        let base = if pkg.is_dependency {
            format!("{}/{}", CACHE_DIR, pkg.name)
        } else {
            if main_found {
                return Err(PkgError::new(
                    ErrorKind::Config,
                    "found multiple non-dependency packages",
                ));
            }
            main_found = true;
            String::new()
        };

        write_package(writer, pkg, &base)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Source, ZipByteSource};
    use std::io::Cursor;

    #[test]
    fn exported_archive_reopens_as_a_package() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("api")).unwrap();
        std::fs::write(
            dir.path().join("pgpkg.toml"),
            "Package = \"example.com/demo\"\nSchemas = [\"demo\"]\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("api/v.sql"),
            "create view demo.v as select 1;",
        )
        .unwrap();

        let mut project =
            Project::from_path(dir.path().to_str().unwrap(), Vec::new()).unwrap();

        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = ZipWriter::new(&mut buf);
            write_project(&mut writer, &mut project).unwrap();
            writer.finish().unwrap();
        }

        let archive = ZipByteSource::new(buf.into_inner(), "demo.zip").unwrap();
        assert!(archive.exists("pgpkg.toml"));
        assert!(archive.exists("api/v.sql"));

        let pkg = crate::package::Package::read("demo.zip", Box::new(archive)).unwrap();
        assert_eq!(pkg.name, "example.com/demo");
        assert_eq!(pkg.mob.unit_paths().collect::<Vec<_>>(), vec!["api/v.sql"]);
    }
}
