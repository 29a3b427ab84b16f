//! End-to-end installs against a live database. Skipped unless
//! `PGPKG_TEST_DSN` is set.

mod common;

use common::*;
use pgpkg_core::{connect_options, temp, DirSource, ErrorKind, Project};
use serial_test::serial;
use sqlx::{Connection, Row};

#[tokio::test]
#[serial]
async fn two_packages_install_in_dependency_order() {
    let Some(dsn) = test_dsn() else { return };
    let admin = connect_options(&dsn).unwrap();
    let db = temp::create_temp_db(&admin).await.unwrap();
    let connect_to = admin.clone().database(&db);

    let root = tempfile::tempdir().unwrap();
    write_config(root.path(), "a/pgpkg.toml", "example.com/a", "a", &[]);
    write_file(
        root.path(),
        "a/api/f.sql",
        "create function a.f() returns text language sql as $$ select 'from-a'::text $$;",
    );
    write_config(
        root.path(),
        "b/pgpkg.toml",
        "example.com/b",
        "b",
        &["example.com/a"],
    );
    write_file(
        root.path(),
        "b/api/g.sql",
        "create function b.g() returns text language sql as $$ select a.f() $$;",
    );

    let mut project = Project::new().unwrap();
    project
        .add_source(Box::new(DirSource::new(root.path().join("a"))), false)
        .unwrap();
    project
        .add_source(Box::new(DirSource::new(root.path().join("b"))), false)
        .unwrap();
    project.migrate(&connect_to).await.unwrap();

    let mut conn = connect(&connect_to).await;
    let row = sqlx::query("select b.g()")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    let value: String = row.get(0);
    assert_eq!(value, "from-a");

    // Both packages are registered and their objects recorded.
    assert_eq!(
        count_where(&mut conn, "select count(*) from pgpkg.pkg where pkg = $1", "example.com/a")
            .await,
        1
    );
    assert_eq!(
        count_where(
            &mut conn,
            "select count(*) from pgpkg.managed_object where pkg = $1",
            "example.com/b"
        )
        .await,
        1
    );

    conn.close().await.unwrap();
    temp::drop_temp_db(&admin, &db).await.unwrap();
}

#[tokio::test]
#[serial]
async fn dependency_cycles_fail_before_any_write() {
    let Some(dsn) = test_dsn() else { return };
    let admin = connect_options(&dsn).unwrap();
    let db = temp::create_temp_db(&admin).await.unwrap();
    let connect_to = admin.clone().database(&db);

    let root = tempfile::tempdir().unwrap();
    write_config(root.path(), "a/pgpkg.toml", "example.com/a", "a", &["example.com/b"]);
    write_config(root.path(), "b/pgpkg.toml", "example.com/b", "b", &["example.com/a"]);

    let mut project = Project::new().unwrap();
    project
        .add_source(Box::new(DirSource::new(root.path().join("a"))), false)
        .unwrap();
    project
        .add_source(Box::new(DirSource::new(root.path().join("b"))), false)
        .unwrap();

    let err = project.migrate(&connect_to).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cycle);

    let mut conn = connect(&connect_to).await;
    assert!(!schema_exists(&mut conn, "a").await);
    assert!(!schema_exists(&mut conn, "b").await);
    assert!(!schema_exists(&mut conn, "pgpkg").await);

    conn.close().await.unwrap();
    temp::drop_temp_db(&admin, &db).await.unwrap();
}

#[tokio::test]
#[serial]
async fn resolver_orders_forward_references() {
    let Some(dsn) = test_dsn() else { return };
    let admin = connect_options(&dsn).unwrap();
    let db = temp::create_temp_db(&admin).await.unwrap();
    let connect_to = admin.clone().database(&db);

    let root = tempfile::tempdir().unwrap();
    write_config(root.path(), "x/pgpkg.toml", "example.com/x", "x", &[]);
    // x.a() is declared first but depends on x.b(); the resolver must
    // install b before a.
    write_file(
        root.path(),
        "x/api/funcs.sql",
        "create function x.a() returns integer language sql as $$ select x.b() $$;\n\
         create function x.b() returns integer language sql as $$ select 41 + 1 $$;",
    );

    let mut project = Project::new().unwrap();
    project
        .add_source(Box::new(DirSource::new(root.path().join("x"))), false)
        .unwrap();
    project.migrate(&connect_to).await.unwrap();

    let mut conn = connect(&connect_to).await;
    let row = sqlx::query("select x.a()")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    let value: i32 = row.get(0);
    assert_eq!(value, 42);

    // The recorded install order ends with x.a.
    let rows = sqlx::query(
        "select obj_name from pgpkg.managed_object where pkg = $1 order by seq",
    )
    .bind("example.com/x")
    .fetch_all(&mut conn)
    .await
    .unwrap();
    let names: Vec<String> = rows.iter().map(|r| r.get(0)).collect();
    assert_eq!(names.len(), 2);
    assert!(names[0].contains("\"b\""), "order: {:?}", names);
    assert!(names[1].contains("\"a\""), "order: {:?}", names);

    conn.close().await.unwrap();
    temp::drop_temp_db(&admin, &db).await.unwrap();
}

#[tokio::test]
#[serial]
async fn migrations_apply_once_across_installs() {
    let Some(dsn) = test_dsn() else { return };
    let admin = connect_options(&dsn).unwrap();
    let db = temp::create_temp_db(&admin).await.unwrap();
    let connect_to = admin.clone().database(&db);

    let root = tempfile::tempdir().unwrap();
    write_config(root.path(), "m/pgpkg.toml", "example.com/m", "m", &[]);
    write_file(root.path(), "m/schema/@migration.pgpkg", "0001.sql\n0002.sql\n");
    write_file(
        root.path(),
        "m/schema/0001.sql",
        "create table m.items (id integer primary key);",
    );
    write_file(
        root.path(),
        "m/schema/0002.sql",
        "alter table m.items add column name text;",
    );

    let pkg_path = root.path().join("m").display().to_string();

    let mut project = Project::from_path(&pkg_path, Vec::new()).unwrap();
    project.migrate(&connect_to).await.unwrap();

    let mut conn = connect(&connect_to).await;
    assert_eq!(
        count_where(
            &mut conn,
            "select count(*) from pgpkg.migration where pkg = $1",
            "example.com/m"
        )
        .await,
        2
    );
    conn.close().await.unwrap();

    // Second install of the unchanged project: no new ledger rows, no DDL.
    let mut project = Project::from_path(&pkg_path, Vec::new()).unwrap();
    project.migrate(&connect_to).await.unwrap();

    let mut conn = connect(&connect_to).await;
    assert_eq!(
        count_where(
            &mut conn,
            "select count(*) from pgpkg.migration where pkg = $1",
            "example.com/m"
        )
        .await,
        2
    );

    conn.close().await.unwrap();
    temp::drop_temp_db(&admin, &db).await.unwrap();
}

#[tokio::test]
#[serial]
async fn failing_test_rolls_back_the_whole_install() {
    let Some(dsn) = test_dsn() else { return };
    let admin = connect_options(&dsn).unwrap();
    let db = temp::create_temp_db(&admin).await.unwrap();
    let connect_to = admin.clone().database(&db);

    let root = tempfile::tempdir().unwrap();
    write_config(root.path(), "f/pgpkg.toml", "example.com/f", "f", &[]);
    write_file(root.path(), "f/schema/@migration.pgpkg", "0001.sql\n");
    write_file(
        root.path(),
        "f/schema/0001.sql",
        "create table f.items (id integer);",
    );
    write_file(
        root.path(),
        "f/api/boom_test.sql",
        "create function f.boom_test() returns void language plpgsql as $$ \
         begin raise exception 'boom'; end $$;",
    );

    let pkg_path = root.path().join("f").display().to_string();
    let mut project = Project::from_path(&pkg_path, Vec::new()).unwrap();
    let err = project.migrate(&connect_to).await.unwrap_err();
    assert_eq!(err.root().kind(), ErrorKind::ExecRuntime);

    // Nothing survives: not the package schema, not even pgpkg's own.
    let mut conn = connect(&connect_to).await;
    assert!(!schema_exists(&mut conn, "f").await);
    assert!(!schema_exists(&mut conn, "pgpkg").await);

    conn.close().await.unwrap();
    temp::drop_temp_db(&admin, &db).await.unwrap();
}

#[tokio::test]
#[serial]
async fn reinstall_recreates_managed_objects() {
    let Some(dsn) = test_dsn() else { return };
    let admin = connect_options(&dsn).unwrap();
    let db = temp::create_temp_db(&admin).await.unwrap();
    let connect_to = admin.clone().database(&db);

    let root = tempfile::tempdir().unwrap();
    write_config(root.path(), "r/pgpkg.toml", "example.com/r", "r", &[]);
    write_file(
        root.path(),
        "r/api/v.sql",
        "create view r.v as select 1 as one;",
    );

    let pkg_path = root.path().join("r").display().to_string();

    let mut project = Project::from_path(&pkg_path, Vec::new()).unwrap();
    project.migrate(&connect_to).await.unwrap();

    // Change the view definition; the reinstall drops and recreates it.
    write_file(
        root.path(),
        "r/api/v.sql",
        "create view r.v as select 2 as one;",
    );
    let mut project = Project::from_path(&pkg_path, Vec::new()).unwrap();
    project.migrate(&connect_to).await.unwrap();

    let mut conn = connect(&connect_to).await;
    let row = sqlx::query("select one from r.v")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    let value: i32 = row.get(0);
    assert_eq!(value, 2);

    conn.close().await.unwrap();
    temp::drop_temp_db(&admin, &db).await.unwrap();
}
