//! Scratch databases.
//!
//! `pgpkg test` and `pgpkg repl` install into a temporary database that is
//! dropped afterwards. Database names can't be bound as parameters, so the
//! generated names are restricted to characters that are safe to
//! interpolate unquoted inside the quoted identifier.

use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use uuid::Uuid;

use crate::error::{ErrorKind, PkgError, Result};

fn safe_db_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.')
}

async fn admin_connect(connect: &PgConnectOptions) -> Result<PgConnection> {
    PgConnection::connect_with(connect).await.map_err(|e| {
        PkgError::new(ErrorKind::CatalogAccess, "unable to open database").with_source(e)
    })
}

/// Create a temporary database with a random name and return the name.
pub async fn create_temp_db(connect: &PgConnectOptions) -> Result<String> {
    let suffix = Uuid::new_v4().simple().to_string();
    let dbname = format!("pgpkg.{}", &suffix[..12]);
    debug_assert!(safe_db_name(&dbname));

    let mut conn = admin_connect(connect).await?;
    sqlx::raw_sql(&format!("create database \"{}\"", dbname))
        .execute(&mut conn)
        .await
        .map_err(|e| {
            PkgError::new(
                ErrorKind::CatalogAccess,
                format!("unable to create temp database \"{}\"", dbname),
            )
            .with_source(e)
        })?;
    let _ = conn.close().await;
    Ok(dbname)
}

/// Drop a database created by [`create_temp_db`].
pub async fn drop_temp_db(connect: &PgConnectOptions, dbname: &str) -> Result<()> {
    if !safe_db_name(dbname) {
        return Err(PkgError::new(
            ErrorKind::Config,
            format!("refusing to drop database \"{}\"", dbname),
        ));
    }

    let mut conn = admin_connect(connect).await?;
    sqlx::raw_sql(&format!("drop database \"{}\"", dbname))
        .execute(&mut conn)
        .await
        .map_err(|e| {
            PkgError::new(
                ErrorKind::CatalogAccess,
                format!("unable to drop temp database \"{}\"", dbname),
            )
            .with_source(e)
        })?;
    let _ = conn.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_names_are_safe() {
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!("pgpkg.{}", &suffix[..12]);
        assert!(safe_db_name(&name));
    }

    #[test]
    fn unsafe_names_are_refused() {
        assert!(!safe_db_name("pgpkg\"; drop database prod;--"));
        assert!(!safe_db_name("PGPKG.ABC"));
        assert!(!safe_db_name(""));
    }
}
