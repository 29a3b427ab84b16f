//! Package configuration (`pgpkg.toml`).

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, PkgError, Result};
use crate::ident::{check_package_name, sanitize, SCHEMA_PATTERN};

/// Marker file that makes a directory (or archive subtree) a package.
pub const CONFIG_FILENAME: &str = "pgpkg.toml";

/// Parsed `pgpkg.toml`. Field names are capitalized on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Canonical package name, e.g. `github.com/pgpkg/pgpkg`.
    #[serde(rename = "Package")]
    pub package: String,

    /// Deprecated singular form, accepted as an alias for `Schemas` and
    /// never written back.
    #[serde(rename = "Schema", skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Schema names owned by this package.
    #[serde(rename = "Schemas", skip_serializing_if = "Vec::is_empty")]
    pub schemas: Vec<String>,

    /// Database extensions the package needs.
    #[serde(rename = "Extensions", skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,

    /// Names of packages this package depends on.
    #[serde(rename = "Uses", skip_serializing_if = "Vec::is_empty")]
    pub uses: Vec<String>,

    /// Ordered migration paths, relative to the package root. Mutually
    /// exclusive with a `@migration.pgpkg` index file.
    #[serde(rename = "Migrations", skip_serializing_if = "Option::is_none")]
    pub migrations: Option<Vec<String>>,
}

impl Config {
    /// Parse and validate a `pgpkg.toml` document.
    pub fn parse(text: &str) -> Result<Config> {
        let mut config: Config = toml::from_str(text).map_err(|e| {
            PkgError::new(ErrorKind::Config, "unable to read package config").with_source(e)
        })?;

        // Fold the deprecated singular form into the plural one.
        if let Some(schema) = config.schema.take() {
            if config.schemas.is_empty() {
                config.schemas = vec![schema];
            } else {
                return Err(PkgError::new(
                    ErrorKind::Config,
                    "only one of Schema and Schemas may be set",
                ));
            }
        }

        check_package_name(&config.package)?;

        if config.schemas.is_empty() {
            return Err(PkgError::new(
                ErrorKind::Config,
                format!("package {} declares no schemas", config.package),
            ));
        }

        for schema in &config.schemas {
            sanitize(&SCHEMA_PATTERN, schema).map_err(|_| {
                PkgError::new(
                    ErrorKind::Config,
                    format!("illegal schema name in pgpkg.toml: {}", schema),
                )
            })?;
        }

        for uses in &config.uses {
            check_package_name(uses)?;
        }

        Ok(config)
    }

    /// Serialize for writing to a cache or archive.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| {
            PkgError::new(ErrorKind::Config, "unable to write package config").with_source(e)
        })
    }

    /// Add a dependency, returning true if the config changed.
    pub fn add_uses(&mut self, name: &str) -> bool {
        if self.uses.iter().any(|u| u == name) {
            false
        } else {
            self.uses.push(name.to_string());
            true
        }
    }
}
