//! Managed-object identification.
//!
//! Every statement in a managed-object bundle (and every test statement)
//! must declare exactly one object pgpkg knows how to manage. This module
//! inspects the statement's syntax tree and derives the object's identity:
//! its type, its schema, and a canonical name precise enough to drop the
//! object again on the next install.

use pg_query::protobuf::node::Node as NodeEnum;
use pg_query::protobuf::{self, Node};

use crate::error::{ErrorKind, PkgError, Result};
use crate::statement::Statement;

/// Identity of a managed database object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedObject {
    /// Schema the object lives in.
    pub schema: String,
    /// Object kind: `function`, `view`, `trigger`, `cast`, or
    /// `comment on function` / `comment on view` / `comment on column`.
    pub object_type: String,
    /// Canonical, quoted name. Interpolating this after `drop <type>
    /// if exists` (or `<type> ... is null` for comments) yields valid SQL.
    pub name: String,
    /// Unqualified name of the object, used to classify test functions.
    pub local_name: String,
    /// Formatted argument list, for functions.
    pub args: Vec<String>,
}

impl ManagedObject {
    /// Identity key used for duplicate detection.
    pub fn key(&self) -> String {
        format!("{}:{}", self.object_type, self.name)
    }
}

/// The SQL that removes (or clears, for comments) a recorded object.
/// `CASCADE` is deliberately never used: anything outside the package that
/// leans on a managed object should fail the purge, not vanish with it.
pub fn drop_sql(object_type: &str, name: &str) -> String {
    if object_type == "cast" {
        format!("drop cast if exists ({})", name)
    } else if object_type.starts_with("comment on") {
        format!("{} {} is null", object_type, name)
    } else {
        format!("drop {} if exists {}", object_type, name)
    }
}

/// Identify the managed object a statement declares. Fails for statement
/// kinds that do not belong in a managed-object bundle, for objects without
/// an explicit schema, and for schemas the package does not declare.
pub fn identify(stmt: &Statement, schemas: &[String]) -> Result<ManagedObject> {
    let node = stmt.node.as_ref().ok_or_else(|| unsupported(stmt))?;

    match node {
        NodeEnum::CreateFunctionStmt(cfs) => function_object(stmt, cfs, schemas),
        NodeEnum::ViewStmt(vs) => view_object(stmt, vs, schemas),
        NodeEnum::CreateTrigStmt(ts) => trigger_object(stmt, ts, schemas),
        NodeEnum::CreateCastStmt(cs) => cast_object(stmt, cs),
        NodeEnum::CommentStmt(cs) => comment_object(stmt, cs, schemas),
        _ => Err(unsupported(stmt)),
    }
}

fn unsupported(stmt: &Statement) -> PkgError {
    PkgError::new(
        ErrorKind::Parse,
        "only functions, views, triggers, casts and comments can be managed objects",
    )
    .at(stmt)
}

fn check_schema(stmt: &Statement, schema: &str, schemas: &[String], what: &str) -> Result<()> {
    if schema.is_empty() {
        return Err(PkgError::new(
            ErrorKind::Parse,
            format!("no schema declared on {}", what),
        )
        .at(stmt));
    }
    if !schemas.iter().any(|s| s == schema) {
        return Err(PkgError::new(
            ErrorKind::Parse,
            format!("{} schema {} is not declared in package", what, schema),
        )
        .at(stmt));
    }
    Ok(())
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn node_str(node: &Node) -> &str {
    match &node.node {
        Some(NodeEnum::String(s)) => &s.sval,
        _ => "",
    }
}

fn string_list(nodes: &[Node]) -> Vec<&str> {
    nodes.iter().map(node_str).collect()
}

/// A type name as written (and normalized) by the parser, with array bounds.
fn type_name(tn: &protobuf::TypeName) -> String {
    let mut name = string_list(&tn.names).join(".");
    for _ in &tn.array_bounds {
        name.push_str("[]");
    }
    name
}

fn function_object(
    stmt: &Statement,
    cfs: &protobuf::CreateFunctionStmt,
    schemas: &[String],
) -> Result<ManagedObject> {
    let names = string_list(&cfs.funcname);
    let (schema, fname) = match names.as_slice() {
        [schema, fname] => (schema.to_string(), fname.to_string()),
        _ => {
            return Err(
                PkgError::new(ErrorKind::Parse, "no function schema declared").at(stmt),
            )
        }
    };
    check_schema(stmt, &schema, schemas, "function")?;

    // Only the signature-forming parameters take part in the identity;
    // OUT and TABLE parameters don't.
    let mut args = Vec::new();
    for param in &cfs.parameters {
        if let Some(NodeEnum::FunctionParameter(fp)) = &param.node {
            use protobuf::FunctionParameterMode as Mode;
            let mode = fp.mode;
            if mode == Mode::FuncParamIn as i32
                || mode == Mode::FuncParamInout as i32
                || mode == Mode::FuncParamDefault as i32
            {
                let ty = fp
                    .arg_type
                    .as_ref()
                    .map(type_name)
                    .unwrap_or_default();
                if fp.name.is_empty() {
                    args.push(ty);
                } else {
                    args.push(format!("{} {}", fp.name, ty));
                }
            }
        }
    }

    Ok(ManagedObject {
        name: format!("{}.{}({})", quote(&schema), quote(&fname), args.join(", ")),
        local_name: fname,
        schema,
        object_type: "function".to_string(),
        args,
    })
}

fn view_object(
    stmt: &Statement,
    vs: &protobuf::ViewStmt,
    schemas: &[String],
) -> Result<ManagedObject> {
    let view = vs
        .view
        .as_ref()
        .ok_or_else(|| PkgError::new(ErrorKind::Parse, "malformed view statement").at(stmt))?;
    check_schema(stmt, &view.schemaname, schemas, "view")?;

    Ok(ManagedObject {
        name: format!("{}.{}", quote(&view.schemaname), quote(&view.relname)),
        local_name: view.relname.clone(),
        schema: view.schemaname.clone(),
        object_type: "view".to_string(),
        args: Vec::new(),
    })
}

fn trigger_object(
    stmt: &Statement,
    ts: &protobuf::CreateTrigStmt,
    schemas: &[String],
) -> Result<ManagedObject> {
    let relation = ts
        .relation
        .as_ref()
        .ok_or_else(|| PkgError::new(ErrorKind::Parse, "malformed trigger statement").at(stmt))?;
    check_schema(stmt, &relation.schemaname, schemas, "trigger table")?;

    Ok(ManagedObject {
        name: format!(
            "{} on {}.{}",
            quote(&ts.trigname),
            quote(&relation.schemaname),
            quote(&relation.relname)
        ),
        local_name: ts.trigname.clone(),
        schema: relation.schemaname.clone(),
        object_type: "trigger".to_string(),
        args: Vec::new(),
    })
}

fn cast_object(stmt: &Statement, cs: &protobuf::CreateCastStmt) -> Result<ManagedObject> {
    let source = cs
        .sourcetype
        .as_ref()
        .map(type_name)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| PkgError::new(ErrorKind::Parse, "malformed cast statement").at(stmt))?;
    let target = cs
        .targettype
        .as_ref()
        .map(type_name)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| PkgError::new(ErrorKind::Parse, "malformed cast statement").at(stmt))?;

    // Casts have no schema of their own; they are recorded against public.
    Ok(ManagedObject {
        name: format!("{} as {}", source, target),
        local_name: String::new(),
        schema: "public".to_string(),
        object_type: "cast".to_string(),
        args: Vec::new(),
    })
}

fn comment_object(
    stmt: &Statement,
    cs: &protobuf::CommentStmt,
    schemas: &[String],
) -> Result<ManagedObject> {
    use protobuf::ObjectType;

    let object = cs
        .object
        .as_ref()
        .ok_or_else(|| PkgError::new(ErrorKind::Parse, "malformed comment statement").at(stmt))?;

    if cs.objtype == ObjectType::ObjectFunction as i32 {
        let names = match &object.node {
            Some(NodeEnum::ObjectWithArgs(owa)) => string_list(&owa.objname),
            _ => Vec::new(),
        };
        let (schema, fname) = match names.as_slice() {
            [schema, fname] => (schema.to_string(), fname.to_string()),
            _ => {
                return Err(PkgError::new(
                    ErrorKind::Parse,
                    "no schema declared on comment target",
                )
                .at(stmt))
            }
        };
        check_schema(stmt, &schema, schemas, "comment target")?;
        // The argument list is not part of a comment's identity; comments on
        // overloaded functions may collide, which is accepted.
        return Ok(ManagedObject {
            name: format!("{}.{}", quote(&schema), quote(&fname)),
            local_name: fname,
            schema,
            object_type: "comment on function".to_string(),
            args: Vec::new(),
        });
    }

    let names = match &object.node {
        Some(NodeEnum::List(list)) => string_list(&list.items),
        _ => Vec::new(),
    };

    if cs.objtype == ObjectType::ObjectView as i32 {
        let (schema, vname) = match names.as_slice() {
            [schema, vname] => (schema.to_string(), vname.to_string()),
            _ => {
                return Err(PkgError::new(
                    ErrorKind::Parse,
                    "no schema declared on comment target",
                )
                .at(stmt))
            }
        };
        check_schema(stmt, &schema, schemas, "comment target")?;
        return Ok(ManagedObject {
            name: format!("{}.{}", quote(&schema), quote(&vname)),
            local_name: vname,
            schema,
            object_type: "comment on view".to_string(),
            args: Vec::new(),
        });
    }

    if cs.objtype == ObjectType::ObjectColumn as i32 {
        let (schema, table, column) = match names.as_slice() {
            [schema, table, column] => {
                (schema.to_string(), table.to_string(), column.to_string())
            }
            _ => {
                return Err(PkgError::new(
                    ErrorKind::Parse,
                    "comment on column requires a schema-qualified target",
                )
                .at(stmt))
            }
        };
        check_schema(stmt, &schema, schemas, "comment target")?;
        return Ok(ManagedObject {
            name: format!("{}.{}.{}", quote(&schema), quote(&table), quote(&column)),
            local_name: column,
            schema,
            object_type: "comment on column".to_string(),
            args: Vec::new(),
        });
    }

    Err(PkgError::new(
        ErrorKind::Parse,
        "only comments on functions, views and columns can be managed objects",
    )
    .at(stmt))
}
