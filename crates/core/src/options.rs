//! Global install options.
//!
//! Options are parsed once by the caller, frozen, and read many times by the
//! engine. They are process-global: a project install is a single sequential
//! job, and threading the option set through every call adds nothing.

use std::sync::OnceLock;

use regex::Regex;

/// Options controlling an install run.
#[derive(Debug, Default)]
pub struct Options {
    /// Log every SQL statement as it executes.
    pub verbose: bool,
    /// Print a per-package summary when the install finishes.
    pub summary: bool,
    /// Run the full install (including tests) but roll back instead of
    /// committing. The install reports [`crate::PkgError::user_request`].
    pub dry_run: bool,
    /// Log a pass/fail line for each test.
    pub show_tests: bool,
    /// Log tests skipped by the include/exclude patterns.
    pub show_skipped: bool,
    /// Don't run tests at all.
    pub skip_tests: bool,
    /// Leave test functions installed after the run. Only sensible on
    /// disposable databases.
    pub keep_test_scripts: bool,
    /// Only run tests whose unqualified name matches.
    pub include_tests: Option<Regex>,
    /// Skip tests whose unqualified name matches.
    pub exclude_tests: Option<Regex>,
    /// Use this role for all packages instead of the derived `$pkg` roles.
    pub force_role: Option<String>,
}

static OPTIONS: OnceLock<Options> = OnceLock::new();

/// Freeze the process-wide options. Later calls are ignored; the first
/// caller wins.
pub fn set(options: Options) {
    let _ = OPTIONS.set(options);
}

/// The frozen options, or defaults if [`set`] was never called (library
/// embedders and tests).
pub fn get() -> &'static Options {
    OPTIONS.get_or_init(Options::default)
}
