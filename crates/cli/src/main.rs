//! pgpkg command-line binary.

mod cli;
mod commands;

use clap::Parser;
use pgpkg_core::PkgError;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.install.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let dry_run = matches!(cli.command, Commands::Try { .. });
    let mut options = match cli.install.to_options(dry_run) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("pgpkg: {}", e);
            std::process::exit(1);
        }
    };
    if matches!(cli.command, Commands::Test { .. }) {
        options.show_tests = true;
    }
    pgpkg_core::options::set(options);

    let dsn = cli
        .dsn
        .clone()
        .or_else(|| std::env::var("DSN").ok())
        .unwrap_or_default();

    let result = match &cli.command {
        Commands::Deploy { path } | Commands::Try { path } => {
            commands::deploy(&dsn, path.as_deref()).await
        }
        Commands::Test { path } => commands::test(&dsn, path.as_deref()).await,
        Commands::Repl { path } => commands::repl(&dsn, path.as_deref()).await,
        Commands::Export { path } => commands::export(path.as_deref()).await,
        Commands::Import { paths } => commands::import(paths).await,
    };

    if let Err(err) = result {
        // A clean dry run reports itself as an error so callers can tell
        // it apart from a commit; it exits zero.
        if let Some(pkg_err) = err.downcast_ref::<PkgError>() {
            if pkg_err.is_user_request() {
                eprintln!("pgpkg: rolled back, database unchanged");
                return;
            }
            eprint!("{}", pkg_err.render_root(2));
            std::process::exit(1);
        }
        eprintln!("pgpkg: {}", err);
        std::process::exit(1);
    }
}
