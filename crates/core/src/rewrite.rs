//! Function rewriting.
//!
//! Managed functions are rewritten before execution so their bodies can
//! refer to package objects without qualification: a `SET search_path`
//! option naming the package's first schema is prepended, along with
//! `SECURITY DEFINER` so the function runs with its owning role's rights.
//!
//! The rewrite is a pure AST transformation: parse, append the options to
//! the `CREATE FUNCTION` node, and re-emit. The source is never patched as
//! text. One limitation is inherited from the parser: quoting of argument
//! names is not preserved, so quoted argument identifiers should be
//! avoided in managed functions.

use pg_query::protobuf::node::Node as NodeEnum;
use pg_query::protobuf::{self, Node};

use crate::error::{ErrorKind, PkgError, Result};
use crate::statement::Statement;

fn make_node(node: NodeEnum) -> Node {
    Node { node: Some(node) }
}

fn string_const(value: &str) -> Node {
    make_node(NodeEnum::AConst(
        protobuf::AConst {
            val: Some(protobuf::a_const::Val::Sval(protobuf::String {
                sval: value.to_string(),
            })),
            ..Default::default()
        }
        .into(),
    ))
}

fn security_definer_option() -> Node {
    make_node(NodeEnum::DefElem(
        protobuf::DefElem {
            defname: "security".to_string(),
            arg: Some(
                make_node(NodeEnum::Boolean(protobuf::Boolean { boolval: true }.into())).into(),
            ),
            location: -1,
            ..Default::default()
        }
        .into(),
    ))
}

fn search_path_option(schemas: &[&str]) -> Node {
    make_node(NodeEnum::DefElem(
        protobuf::DefElem {
            defname: "set".to_string(),
            arg: Some(
                make_node(NodeEnum::VariableSetStmt(
                    protobuf::VariableSetStmt {
                        kind: protobuf::VariableSetKind::VarSetValue as i32,
                        name: "search_path".to_string(),
                        args: schemas.iter().map(|s| string_const(s)).collect(),
                        is_local: false,
                        ..Default::default()
                    }
                    .into(),
                ))
                .into(),
            ),
            location: -1,
            ..Default::default()
        }
        .into(),
    ))
}

/// Rewrite a `CREATE FUNCTION` statement in place, setting its search path
/// to `schema, pg_temp, public` and marking it `SECURITY DEFINER`.
pub fn rewrite_function(stmt: &mut Statement, schema: &str) -> Result<()> {
    let mut parsed = pg_query::parse(&stmt.source)
        .map_err(|e| {
            PkgError::new(ErrorKind::Parse, "unable to rewrite function")
                .at(stmt)
                .with_source(e)
        })?
        .protobuf;

    let raw = parsed.stmts.first_mut().ok_or_else(|| {
        PkgError::new(ErrorKind::Parse, "unable to rewrite function: empty statement").at(stmt)
    })?;

    let node = raw.stmt.as_mut().and_then(|n| n.node.as_mut());
    match node {
        Some(NodeEnum::CreateFunctionStmt(cfs)) => {
            cfs.options.push(security_definer_option());
            cfs.options
                .push(search_path_option(&[schema, "pg_temp", "public"]));
        }
        _ => {
            return Err(PkgError::new(
                ErrorKind::Parse,
                "only functions can be rewritten",
            )
            .at(stmt))
        }
    }

    stmt.source = pg_query::deparse(&parsed).map_err(|e| {
        PkgError::new(ErrorKind::Parse, "unable to generate rewritten function")
            .at(stmt)
            .with_source(e)
    })?;

    Ok(())
}
