//! Dry-run semantics. This lives in its own test binary because the
//! install options freeze once per process, and dry-run must be on here.
//! Skipped unless `PGPKG_TEST_DSN` is set.

mod common;

use common::*;
use pgpkg_core::{connect_options, options, temp, Options, Project};
use sqlx::Connection;

#[tokio::test]
async fn dry_run_rolls_back_and_reports_user_request() {
    let Some(dsn) = test_dsn() else { return };

    options::set(Options {
        dry_run: true,
        ..Default::default()
    });

    let admin = connect_options(&dsn).unwrap();
    let db = temp::create_temp_db(&admin).await.unwrap();
    let connect_to = admin.clone().database(&db);

    let root = tempfile::tempdir().unwrap();
    write_config(root.path(), "d/pgpkg.toml", "example.com/d", "d", &[]);
    write_file(root.path(), "d/schema/@migration.pgpkg", "0001.sql\n");
    write_file(
        root.path(),
        "d/schema/0001.sql",
        "create table d.items (id integer);",
    );
    write_file(
        root.path(),
        "d/api/v.sql",
        "create view d.v as select count(*) as n from d.items;",
    );

    let pkg_path = root.path().join("d").display().to_string();
    let mut project = Project::from_path(&pkg_path, Vec::new()).unwrap();

    // A clean install under dry-run surfaces the distinguished
    // user-request outcome, not a failure.
    let err = project.migrate(&connect_to).await.unwrap_err();
    assert!(err.is_user_request(), "unexpected error: {}", err);

    // A new connection observes a pristine database: no schemas, no
    // ledger, no roles.
    let mut conn = connect(&connect_to).await;
    assert!(!schema_exists(&mut conn, "d").await);
    assert!(!schema_exists(&mut conn, "pgpkg").await);
    assert_eq!(
        count_where(
            &mut conn,
            "select count(*) from pg_roles where rolname = $1",
            "$example.com/d"
        )
        .await,
        0
    );

    conn.close().await.unwrap();
    temp::drop_temp_db(&admin, &db).await.unwrap();
}
