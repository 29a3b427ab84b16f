//! Command implementations.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context};
use pgpkg_core::config::CONFIG_FILENAME;
use pgpkg_core::{connect_options, temp, Config, Project};
use tracing::info;
use zip::ZipWriter;

/// Search upwards from the current directory for a `pgpkg.toml`, stopping
/// at the user's home directory.
fn find_default_pkg() -> anyhow::Result<String> {
    let mut cwd = std::env::current_dir()?;
    let home = std::env::var("HOME").map(PathBuf::from).unwrap_or_default();

    loop {
        if cwd.join(CONFIG_FILENAME).is_file() {
            return Ok(cwd.display().to_string());
        }

        let parent = match cwd.parent() {
            Some(parent) => parent.to_path_buf(),
            None => bail!("no package found"),
        };

        // Only search up to the user's home directory; the current
        // directory itself was already checked.
        if !parent.starts_with(&home) {
            bail!("no package found");
        }
        cwd = parent;
    }
}

/// The package path from the command line, or the default search.
fn find_pkg(path: Option<&str>) -> anyhow::Result<String> {
    match path {
        Some(path) => Ok(path.to_string()),
        None => find_default_pkg(),
    }
}

/// `pgpkg deploy` and `pgpkg try` (dry-run is set in the frozen options).
pub async fn deploy(dsn: &str, path: Option<&str>) -> anyhow::Result<()> {
    let pkg_path = find_pkg(path)?;
    let mut project = Project::from_path(&pkg_path, Vec::new())?;
    let connect = connect_options(dsn)?;
    project.migrate(&connect).await?;
    Ok(())
}

/// `pgpkg test`: build the whole project (tests included) in a scratch
/// database, then drop it.
pub async fn test(dsn: &str, path: Option<&str>) -> anyhow::Result<()> {
    let pkg_path = find_pkg(path)?;
    let mut project = Project::from_path(&pkg_path, Vec::new())?;

    let admin = connect_options(dsn)?;
    let dbname = temp::create_temp_db(&admin).await?;
    let connect = admin.clone().database(&dbname);

    let result = project.migrate(&connect).await;
    temp::drop_temp_db(&admin, &dbname).await?;
    result?;
    Ok(())
}

/// `pgpkg repl`: install into a scratch database, hand the user a psql
/// session, and drop the database when the session ends.
pub async fn repl(dsn: &str, path: Option<&str>) -> anyhow::Result<()> {
    let pkg_path = find_pkg(path)?;
    let mut project = Project::from_path(&pkg_path, Vec::new())?;

    let admin = connect_options(dsn)?;
    let dbname = temp::create_temp_db(&admin).await?;
    let connect = admin.clone().database(&dbname);

    let result = project.migrate(&connect).await;
    if let Err(e) = result {
        temp::drop_temp_db(&admin, &dbname).await?;
        return Err(e.into());
    }

    // Absorb ctrl-c while psql runs, so an interrupted query doesn't kill
    // pgpkg before the scratch database is dropped.
    tokio::spawn(async {
        loop {
            let _ = tokio::signal::ctrl_c().await;
        }
    });

    let status = Command::new("psql")
        .args(["-v", "PROMPT1=pgpkg> ", "-v", "PROMPT2=pgpkg| "])
        .env("PGHOST", admin.get_host())
        .env("PGPORT", admin.get_port().to_string())
        .env("PGUSER", admin.get_username())
        .env("PGDATABASE", &dbname)
        .status();

    temp::drop_temp_db(&admin, &dbname).await?;

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => bail!("psql completed with an error: {}", status),
        Err(e) => Err(anyhow::Error::new(e).context("unable to start psql")),
    }
}

/// `pgpkg export`: write the project and its dependencies to
/// `<package>.zip` in the current directory.
pub async fn export(path: Option<&str>) -> anyhow::Result<()> {
    let pkg_path = find_pkg(path)?;
    let mut project = Project::from_path(&pkg_path, Vec::new())?;

    let root_name = project
        .root()
        .map(|p| p.name.clone())
        .context("project has no primary package")?;
    let base = root_name.rsplit('/').next().unwrap_or(&root_name);
    let zip_name = format!("{}.zip", base);

    let file = fs::File::create(&zip_name)
        .with_context(|| format!("unable to open ZIP file {} for writing", zip_name))?;
    let mut writer = ZipWriter::new(file);
    pgpkg_core::export::write_project(&mut writer, &mut project)?;
    writer.finish().context("unable to finish ZIP archive")?;

    info!("exported to {}", zip_name);
    Ok(())
}

/// `pgpkg import [target] <source>`: copy the source project (and its
/// dependencies) into the target project's cache, and add a `Uses` entry
/// to the target's config.
pub async fn import(paths: &[String]) -> anyhow::Result<()> {
    let (target_path, source_path) = match paths {
        [source] => (find_default_pkg()?, source.clone()),
        [target, source] => (target.clone(), source.clone()),
        _ => bail!("usage: pgpkg import [target] <source>"),
    };

    let target = Project::from_path(&target_path, Vec::new())?;
    let cache = match &target.cache {
        Some(cache) => cache,
        None => bail!("project has no cache"),
    };
    let target_name = target
        .root()
        .map(|p| p.name.clone())
        .context("target project has no primary package")?;

    // Resolve the source's dependencies against the target cache first, so
    // a dependency that is already imported never has to be re-fetched.
    let mut source = Project::from_path(&source_path, vec![Box::new(cache.reader())])?;
    let source_name = source
        .root()
        .map(|p| p.name.clone())
        .context("source project has no primary package")?;

    if source_name == target_name {
        bail!("cowardly refusing to import a project into itself");
    }

    cache.import_project(&mut source)?;

    // Record the new dependency in the target's config.
    let config_path = Path::new(&target_path).join(CONFIG_FILENAME);
    let mut config = Config::parse(&fs::read_to_string(&config_path)?)?;
    if config.add_uses(&source_name) {
        fs::write(&config_path, config.to_toml()?)?;
    }

    info!("imported {} into {}", source_name, target_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_pkg(dir: &Path, name: &str, schema: &str, uses: &[&str]) {
        fs::create_dir_all(dir).unwrap();
        let uses_line = if uses.is_empty() {
            String::new()
        } else {
            format!(
                "Uses = [{}]\n",
                uses.iter()
                    .map(|u| format!("\"{}\"", u))
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };
        fs::write(
            dir.join(CONFIG_FILENAME),
            format!(
                "Package = \"{}\"\nSchemas = [\"{}\"]\n{}",
                name, schema, uses_line
            ),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn import_copies_into_cache_and_adds_uses() {
        let root = tempfile::tempdir().unwrap();
        let target_dir = root.path().join("target");
        let source_dir = root.path().join("dep");
        write_pkg(&target_dir, "example.com/app", "app", &[]);
        write_pkg(&source_dir, "example.com/dep", "dep", &[]);
        fs::create_dir_all(source_dir.join("api")).unwrap();
        fs::write(
            source_dir.join("api/v.sql"),
            "create view dep.v as select 1;",
        )
        .unwrap();

        import(&[
            target_dir.display().to_string(),
            source_dir.display().to_string(),
        ])
        .await
        .unwrap();

        let cached = target_dir.join(".pgpkg/example.com/dep");
        assert!(cached.join("pgpkg.toml").is_file());
        assert!(cached.join("api/v.sql").is_file());

        let config =
            Config::parse(&fs::read_to_string(target_dir.join(CONFIG_FILENAME)).unwrap())
                .unwrap();
        assert_eq!(config.uses, vec!["example.com/dep"]);
    }

    #[tokio::test]
    async fn import_refuses_self() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("app");
        write_pkg(&dir, "example.com/app", "app", &[]);

        let err = import(&[dir.display().to_string(), dir.display().to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cowardly"), "err: {}", err);
    }
}
