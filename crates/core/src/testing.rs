//! The test harness.
//!
//! Test units contain only `CREATE FUNCTION` statements. Functions whose
//! unqualified name ends in `_test` are run as tests; functions ending in
//! `_before` run once before any test; everything else is a helper that is
//! defined but never invoked. The whole bundle runs inside a `test`
//! savepoint that is rolled back afterwards, so tests leave no residue, and
//! each test additionally runs inside its own `unittest` savepoint so tests
//! cannot see each other's data.

use std::collections::HashMap;

use tracing::info;

use crate::error::{ErrorKind, Located, PkgError, Result};
use crate::object;
use crate::options;
use crate::package::Stats;
use crate::resolver::{apply_state, ApplyState};
use crate::source::Source;
use crate::tx::PkgTx;
use crate::unit::Unit;

/// How a test function participates in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestKind {
    /// Runs as a test, in its own savepoint.
    Test,
    /// Runs once before any test, inside the outer savepoint.
    Before,
    /// Defined but not invoked.
    Helper,
}

/// Classify a function by its unqualified name.
pub fn classify(local_name: &str) -> TestKind {
    let name = local_name.to_lowercase();
    if name.ends_with("_test") {
        TestKind::Test
    } else if name.ends_with("_before") {
        TestKind::Before
    } else {
        TestKind::Helper
    }
}

/// A callable test or before-hook.
#[derive(Debug)]
struct TestFn {
    /// Unqualified function name, used for include/exclude filtering.
    local_name: String,
    /// `select "schema"."name"()`.
    call: String,
    /// Location of the defining statement.
    location: String,
    /// Source of the defining statement, for error context.
    source: String,
}

/// The test bundle of one package.
#[derive(Debug, Default)]
pub struct TestBundle {
    units: Vec<Unit>,
}

impl TestBundle {
    /// Create a bundle over the given units.
    pub fn new(units: Vec<Unit>) -> Self {
        TestBundle { units }
    }

    /// True if the bundle has no units.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Paths of the bundle's units, relative to the package root.
    pub fn unit_paths(&self) -> impl Iterator<Item = &str> {
        self.units.iter().map(|u| u.path.as_str())
    }

    /// Parse the bundle: every statement must be a zero-argument-compatible
    /// `CREATE FUNCTION` in a declared schema. Returns the statements to
    /// install plus the before-hooks and tests found.
    fn parse(
        &self,
        source: &dyn Source,
        schemas: &[String],
        stats: &mut Stats,
    ) -> Result<(ApplyState, Vec<TestFn>, Vec<TestFn>)> {
        let mut pending = Vec::new();
        let mut before = Vec::new();
        let mut tests = Vec::new();
        let mut definitions: HashMap<String, String> = HashMap::new();

        for unit in &self.units {
            let statements = unit.parse(source).map_err(|e| {
                PkgError::new(ErrorKind::Parse, "unable to parse tests")
                    .at(unit)
                    .with_source(e)
            })?;

            for mut stmt in statements {
                let obj = object::identify(&stmt, schemas)?;

                if obj.object_type != "function" {
                    return Err(PkgError::new(
                        ErrorKind::Parse,
                        format!(
                            "only functions can be defined in tests; found {} {}",
                            obj.object_type, obj.name
                        ),
                    )
                    .at(&stmt));
                }

                let key = obj.key();
                if let Some(previous) = definitions.get(&key) {
                    return Err(PkgError::new(
                        ErrorKind::Duplicate,
                        format!(
                            "duplicate declaration for {} {}; also defined in {}",
                            obj.object_type, obj.name, previous
                        ),
                    )
                    .at(&stmt));
                }
                definitions.insert(key, stmt.location());

                let kind = classify(&obj.local_name);
                if kind != TestKind::Helper {
                    if !obj.args.is_empty() {
                        return Err(PkgError::new(
                            ErrorKind::Parse,
                            format!(
                                "test functions cannot receive arguments: {}",
                                obj.name
                            ),
                        )
                        .at(&stmt));
                    }

                    let test_fn = TestFn {
                        local_name: obj.local_name.clone(),
                        call: format!(
                            "select \"{}\".\"{}\"()",
                            obj.schema, obj.local_name
                        ),
                        location: stmt.location(),
                        source: stmt.source.clone(),
                    };
                    match kind {
                        TestKind::Before => before.push(test_fn),
                        TestKind::Test => {
                            stats.tests += 1;
                            tests.push(test_fn);
                        }
                        TestKind::Helper => unreachable!(),
                    }
                }

                stmt.object = Some(obj);
                pending.push(stmt);
            }
        }

        Ok((ApplyState::new(pending), before, tests))
    }

    /// Run the bundle: create all functions through the resolver, call the
    /// before-hooks, then call every test inside its own savepoint. A test
    /// failure aborts the whole install.
    pub async fn run(
        &self,
        tx: &mut PkgTx,
        source: &dyn Source,
        schemas: &[String],
        stats: &mut Stats,
    ) -> Result<()> {
        tx.savepoint("test").await?;

        let result = self.run_inner(tx, source, schemas, stats).await;

        if options::get().keep_test_scripts {
            return result;
        }
        match tx.rollback_savepoint("test").await {
            Ok(()) => result,
            Err(rollback_err) => result.and(Err(rollback_err)),
        }
    }

    async fn run_inner(
        &self,
        tx: &mut PkgTx,
        source: &dyn Source,
        schemas: &[String],
        stats: &mut Stats,
    ) -> Result<()> {
        let (mut state, before, tests) = self.parse(source, schemas, stats)?;

        // Helpers may call each other, so installation order is discovered
        // the same way managed objects are.
        apply_state(tx, &mut state, "tests").await?;

        for hook in &before {
            if let Err(err) = tx.execute(&hook.call).await {
                return Err(self.failure(tx, hook, err).await);
            }
        }

        let options = options::get();
        for test in &tests {
            if let Some(include) = &options.include_tests {
                if !include.is_match(&test.local_name) {
                    if options.show_skipped {
                        info!("[SKIP] {}", test.call);
                    }
                    continue;
                }
            }
            if let Some(exclude) = &options.exclude_tests {
                if exclude.is_match(&test.local_name) {
                    if options.show_skipped {
                        info!("[SKIP] {}", test.call);
                    }
                    continue;
                }
            }

            tx.savepoint("unittest").await?;
            let outcome = tx.execute(&test.call).await;
            tx.rollback_savepoint("unittest").await?;

            match outcome {
                Ok(()) => {
                    if options.show_tests {
                        info!("[PASS] {}", test.call);
                    }
                }
                Err(err) => {
                    if options.show_tests {
                        info!("[FAIL] {}", test.call);
                    }
                    return Err(self.failure(tx, test, err).await);
                }
            }
        }

        Ok(())
    }

    async fn failure(&self, tx: &mut PkgTx, test: &TestFn, err: sqlx::Error) -> PkgError {
        let context = tx
            .runtime_context(&test.source, &test.location, &err)
            .await;
        let mut failure = PkgError::new(
            ErrorKind::ExecRuntime,
            format!("test failed: {}", test.call),
        )
        .at_location(test.location.clone())
        .with_source(err);
        if let Some(context) = context {
            failure = failure.with_context(context);
        }
        failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StaticSource;

    #[test]
    fn classification_by_suffix() {
        assert_eq!(classify("insert_widget_test"), TestKind::Test);
        assert_eq!(classify("Widgets_Test"), TestKind::Test);
        assert_eq!(classify("setup_before"), TestKind::Before);
        assert_eq!(classify("make_widget"), TestKind::Helper);
        assert_eq!(classify("testing"), TestKind::Helper);
    }

    fn bundle_for(files: &'static [(&'static str, &'static str)]) -> TestBundle {
        TestBundle::new(
            files
                .iter()
                .map(|(path, _)| Unit::new("example.com/demo", *path))
                .collect(),
        )
    }

    #[test]
    fn parse_collects_tests_and_hooks() {
        static FILES: &[(&str, &str)] = &[(
            "widgets_test.sql",
            "create function demo.setup_before() returns void language sql as $$ select 1 $$;\n\
             create function demo.make_widget() returns integer language sql as $$ select 1 $$;\n\
             create function demo.widget_count_test() returns void language sql as $$ select 1 $$;",
        )];
        let source = StaticSource::new("embedded:test", FILES);
        let bundle = bundle_for(FILES);
        let mut stats = Stats::default();
        let (state, before, tests) = bundle
            .parse(&source, &["demo".to_string()], &mut stats)
            .unwrap();

        assert_eq!(state.pending.len(), 3);
        assert_eq!(before.len(), 1);
        assert_eq!(tests.len(), 1);
        assert_eq!(stats.tests, 1);
        assert_eq!(tests[0].call, "select \"demo\".\"widget_count_test\"()");
    }

    #[test]
    fn parse_rejects_non_functions() {
        static FILES: &[(&str, &str)] =
            &[("bad_test.sql", "create view demo.v as select 1;")];
        let source = StaticSource::new("embedded:test", FILES);
        let bundle = bundle_for(FILES);
        let mut stats = Stats::default();
        let err = bundle
            .parse(&source, &["demo".to_string()], &mut stats)
            .unwrap_err();
        assert!(err.to_string().contains("only functions"), "err: {}", err);
    }

    #[test]
    fn parse_rejects_test_arguments() {
        static FILES: &[(&str, &str)] = &[(
            "bad_test.sql",
            "create function demo.broken_test(v integer) returns void \
             language sql as $$ select v $$;",
        )];
        let source = StaticSource::new("embedded:test", FILES);
        let bundle = bundle_for(FILES);
        let mut stats = Stats::default();
        let err = bundle
            .parse(&source, &["demo".to_string()], &mut stats)
            .unwrap_err();
        assert!(
            err.to_string().contains("cannot receive arguments"),
            "err: {}",
            err
        );
    }

    #[test]
    fn helpers_may_take_arguments() {
        static FILES: &[(&str, &str)] = &[(
            "helper_test.sql",
            "create function demo.make_widget(name text) returns integer \
             language sql as $$ select 1 $$;",
        )];
        let source = StaticSource::new("embedded:test", FILES);
        let bundle = bundle_for(FILES);
        let mut stats = Stats::default();
        let (state, before, tests) = bundle
            .parse(&source, &["demo".to_string()], &mut stats)
            .unwrap();
        assert_eq!(state.pending.len(), 1);
        assert!(before.is_empty());
        assert!(tests.is_empty());
    }
}
