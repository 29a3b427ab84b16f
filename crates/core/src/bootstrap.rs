//! The embedded bootstrap package.
//!
//! pgpkg tracks its own state in the `pgpkg` schema, which is itself
//! installed as a package: the same applicator, the same migration engine.
//! The package is compiled into the binary and always installs before
//! anything else.

use crate::source::StaticSource;

/// Canonical name of the tool's own package.
pub const BOOTSTRAP_PKG: &str = "github.com/pgpkg/pgpkg";

/// Name of the schema pgpkg keeps its state in.
pub const PGPKG_SCHEMA: &str = "pgpkg";

static BOOTSTRAP_FILES: &[(&str, &str)] = &[
    ("pgpkg.toml", include_str!("bootstrap/pgpkg.toml")),
    ("schema/pgpkg.sql", include_str!("bootstrap/schema/pgpkg.sql")),
];

/// The bootstrap package's source tree.
pub fn bootstrap_source() -> StaticSource {
    StaticSource::new("embedded:pgpkg", BOOTSTRAP_FILES)
}
