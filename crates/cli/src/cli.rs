//! Command-line interface definition.

use clap::{Args, Parser, Subcommand};
use pgpkg_core::Options;
use regex::Regex;

/// PostgreSQL packaging and migration tool.
#[derive(Parser, Debug)]
#[command(name = "pgpkg")]
#[command(version, about = "PostgreSQL packaging and migration tool", long_about = None)]
pub struct Cli {
    /// Database DSN as a postgres:// URL. Defaults to $DSN, then the
    /// libpq environment (PGHOST, PGDATABASE, ...).
    #[arg(long, global = true, value_name = "URL")]
    pub dsn: Option<String>,

    #[command(flatten)]
    pub install: InstallFlags,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags shared by every install-shaped command.
#[derive(Args, Debug, Default)]
pub struct InstallFlags {
    /// Log what pgpkg is up to, including every SQL statement
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Print a per-package summary when the install finishes
    #[arg(long, global = true)]
    pub summary: bool,

    /// Print a pass/fail line for each test that runs
    #[arg(long, global = true)]
    pub show_tests: bool,

    /// Log tests skipped by the include/exclude patterns
    #[arg(long, global = true)]
    pub show_skipped: bool,

    /// Don't run tests before committing. Take care with this option
    #[arg(long, global = true)]
    pub skip_tests: bool,

    /// Leave test functions installed. Only for disposable databases
    #[arg(long, global = true)]
    pub keep_test_scripts: bool,

    /// Only run tests whose function name matches the pattern
    #[arg(long, global = true, value_name = "REGEX")]
    pub include_tests: Option<String>,

    /// Run all tests except those whose function name matches
    #[arg(long, global = true, value_name = "REGEX")]
    pub exclude_tests: Option<String>,

    /// Use this role instead of the per-package roles
    #[arg(long, global = true, value_name = "ROLE")]
    pub force_role: Option<String>,
}

impl InstallFlags {
    /// Build the frozen engine options from the parsed flags.
    pub fn to_options(&self, dry_run: bool) -> anyhow::Result<Options> {
        let compile = |pattern: &Option<String>| -> anyhow::Result<Option<Regex>> {
            match pattern {
                Some(p) => Ok(Some(Regex::new(p).map_err(|e| {
                    anyhow::anyhow!("unable to compile pattern {}: {}", p, e)
                })?)),
                None => Ok(None),
            }
        };

        Ok(Options {
            verbose: self.verbose,
            summary: self.summary,
            dry_run,
            show_tests: self.show_tests,
            show_skipped: self.show_skipped,
            skip_tests: self.skip_tests,
            keep_test_scripts: self.keep_test_scripts,
            include_tests: compile(&self.include_tests)?,
            exclude_tests: compile(&self.exclude_tests)?,
            force_role: self.force_role.clone(),
        })
    }
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install the project into the database and commit
    Deploy {
        /// Package directory or ZIP file; defaults to searching upwards
        /// for pgpkg.toml
        path: Option<String>,
    },

    /// Install the project, run the tests, then roll everything back
    Try {
        /// Package directory or ZIP file
        path: Option<String>,
    },

    /// Install the project into a scratch database, then drop it
    Test {
        /// Package directory or ZIP file
        path: Option<String>,
    },

    /// Install into a scratch database and open an interactive psql session
    Repl {
        /// Package directory or ZIP file
        path: Option<String>,
    },

    /// Write the project and its dependencies to a ZIP archive
    Export {
        /// Package directory; defaults to searching upwards for pgpkg.toml
        path: Option<String>,
    },

    /// Import a package and its dependencies into the project cache
    Import {
        /// `[target] <source>`: the project to import into (optional) and
        /// the package to import
        #[arg(value_name = "PATH", num_args = 1..=2, required = true)]
        paths: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_deploy_with_flags() {
        let cli = Cli::parse_from([
            "pgpkg",
            "deploy",
            "--verbose",
            "--include-tests",
            "widget.*",
            "demo",
        ]);
        assert!(cli.install.verbose);
        match cli.command {
            Commands::Deploy { path } => assert_eq!(path.as_deref(), Some("demo")),
            other => panic!("unexpected command: {:?}", other),
        }
        let options = cli.install.to_options(false).unwrap();
        assert!(options.include_tests.unwrap().is_match("widget_count_test"));
    }

    #[test]
    fn bad_pattern_is_an_error() {
        let cli = Cli::parse_from(["pgpkg", "test", "--include-tests", "(["]);
        assert!(cli.install.to_options(false).is_err());
    }

    #[test]
    fn import_takes_one_or_two_paths() {
        let cli = Cli::parse_from(["pgpkg", "import", "dep"]);
        match cli.command {
            Commands::Import { paths } => assert_eq!(paths, vec!["dep"]),
            other => panic!("unexpected command: {:?}", other),
        }

        let cli = Cli::parse_from(["pgpkg", "import", "proj", "dep"]);
        match cli.command {
            Commands::Import { paths } => assert_eq!(paths, vec!["proj", "dep"]),
            other => panic!("unexpected command: {:?}", other),
        }

        assert!(Cli::try_parse_from(["pgpkg", "import"]).is_err());
    }
}
