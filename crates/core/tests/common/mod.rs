//! Shared helpers for database-backed integration tests.
//!
//! These tests need a real PostgreSQL server and only run when
//! `PGPKG_TEST_DSN` is set (a `postgres://` URL with rights to create
//! databases and roles). Each test builds its fixture project on disk,
//! installs it into a scratch database, and drops the database afterwards.

use std::fs;
use std::path::Path;

use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Row};

/// The admin DSN, or `None` to skip the test.
pub fn test_dsn() -> Option<String> {
    std::env::var("PGPKG_TEST_DSN").ok()
}

/// Write a file under the fixture root, creating directories as needed.
pub fn write_file(root: &Path, rel: &str, body: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, body).unwrap();
}

/// Write a minimal `pgpkg.toml`.
pub fn write_config(root: &Path, rel: &str, name: &str, schema: &str, uses: &[&str]) {
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
    write_file(
        root,
        rel,
        &format!(
            "Package = \"{}\"\nSchemas = [\"{}\"]\n{}",
            name, schema, uses_line
        ),
    );
}

/// Open a plain connection for assertions.
pub async fn connect(options: &PgConnectOptions) -> PgConnection {
    PgConnection::connect_with(options).await.unwrap()
}

/// Count rows returned by a query taking one text parameter.
pub async fn count_where(conn: &mut PgConnection, sql: &str, param: &str) -> i64 {
    let row = sqlx::query(sql).bind(param).fetch_one(conn).await.unwrap();
    row.get(0)
}

/// True if the schema exists in the target database.
pub async fn schema_exists(conn: &mut PgConnection, schema: &str) -> bool {
    count_where(
        conn,
        "select count(*) from information_schema.schemata where schema_name = $1",
        schema,
    )
    .await
        == 1
}
