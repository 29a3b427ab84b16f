//! Identifier sanitization.
//!
//! Schema, role and extension names end up interpolated into DDL where bind
//! parameters cannot be used. These patterns are the last line of defence
//! against SQL injection: every identifier is checked immediately before
//! interpolation, regardless of any validation done upstream.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{ErrorKind, PkgError, Result};

/// Schema names: lower-case alphanumeric with `-` and `_`.
pub static SCHEMA_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-z0-9][-_a-z0-9]*$").unwrap());

/// Role names: like schema names, but may carry a leading `$` and the
/// `.`/`/` separators of a package name.
pub static ROLE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[$a-z0-9][-._/a-z0-9]*$").unwrap());

/// Database extension names.
pub static EXTENSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-z0-9][-_a-z0-9]*$").unwrap());

/// Canonical package names: dotted-domain segments optionally followed by
/// path segments, e.g. `github.com/pgpkg/pgpkg`.
static PACKAGE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("^([a-zA-Z0-9_-]+\\.)*[a-zA-Z0-9_-]+(/[a-zA-Z0-9_-]+)*$").unwrap()
});

/// Check an identifier against a pattern, returning it unchanged when it is
/// safe to interpolate. A failure here is a programming error upstream, and
/// is always fatal.
pub fn sanitize<'a>(pattern: &Regex, value: &'a str) -> Result<&'a str> {
    if pattern.is_match(value) {
        Ok(value)
    } else {
        Err(PkgError::new(
            ErrorKind::Config,
            format!("illegal identifier: {}", value),
        ))
    }
}

/// Validate a package name from `pgpkg.toml` (either `Package` or a `Uses`
/// entry).
pub fn check_package_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PkgError::new(ErrorKind::Config, "package name is empty"));
    }
    if !PACKAGE_PATTERN.is_match(name) {
        return Err(PkgError::new(
            ErrorKind::Config,
            format!("invalid package name: {}", name),
        ));
    }
    Ok(())
}

/// Derive the role name owned by a package. Roles are namespaced with a
/// leading `$` so they cannot collide with ordinary database roles.
pub fn role_for_package(pkg_name: &str) -> String {
    format!("${}", pkg_name.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_names() {
        assert!(sanitize(&SCHEMA_PATTERN, "pgpkg").is_ok());
        assert!(sanitize(&SCHEMA_PATTERN, "my_schema-2").is_ok());
        assert!(sanitize(&SCHEMA_PATTERN, "_leading").is_err());
        assert!(sanitize(&SCHEMA_PATTERN, "Upper").is_err());
        assert!(sanitize(&SCHEMA_PATTERN, "bad\"; drop table x;--").is_err());
        assert!(sanitize(&SCHEMA_PATTERN, "").is_err());
    }

    #[test]
    fn role_names() {
        assert!(sanitize(&ROLE_PATTERN, "$github.com/pgpkg/pgpkg").is_ok());
        assert!(sanitize(&ROLE_PATTERN, "plain_role").is_ok());
        assert!(sanitize(&ROLE_PATTERN, "$bad name").is_err());
    }

    #[test]
    fn package_names() {
        assert!(check_package_name("github.com/pgpkg/pgpkg").is_ok());
        assert!(check_package_name("example.com/finance").is_ok());
        assert!(check_package_name("local-pkg").is_ok());
        assert!(check_package_name("").is_err());
        assert!(check_package_name("no spaces").is_err());
        assert!(check_package_name("trailing/").is_err());
        assert!(check_package_name("a;b").is_err());
    }

    #[test]
    fn derived_roles_are_safe() {
        let role = role_for_package("github.com/pgpkg/pgpkg");
        assert_eq!(role, "$github.com/pgpkg/pgpkg");
        assert!(sanitize(&ROLE_PATTERN, &role).is_ok());
    }
}
