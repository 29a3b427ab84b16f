//! Error types for the pgpkg engine.
//!
//! Every error raised by the engine is a [`PkgError`]: a kind, a message, an
//! optional source location (`package:unit:line`), an optional chain of
//! execution contexts (source text plus the line that failed, innermost
//! last), and an optional wrapped underlying error. Statement errors that
//! stall the managed-object resolver are carried as siblings of the
//! principal error so they can be reported together.

use std::fmt;

use thiserror::Error;

/// Result type used throughout the engine.
pub type Result<T> = std::result::Result<T, PkgError>;

/// Classification of engine errors. The kind decides recovery policy: every
/// kind is fatal to the install except `ExecRuntime` inside the resolver
/// loop, and `UserRequest` is reported as success by the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    /// Bad `pgpkg.toml`, illegal identifier, or invalid package name.
    #[error("invalid configuration")]
    Config,
    /// Two statements declare the same managed object, or a migration
    /// basename appears twice.
    #[error("duplicate definition")]
    Duplicate,
    /// The SQL parser rejected a unit.
    #[error("parse error")]
    Parse,
    /// A statement failed while executing.
    #[error("execution failed")]
    ExecRuntime,
    /// The managed-object resolver completed a pass without progress.
    #[error("no installation order found")]
    NoProgress,
    /// A `Uses` entry was not found in any cache.
    #[error("dependency not found")]
    DependencyMissing,
    /// The package dependency graph contains a cycle.
    #[error("dependency cycle")]
    Cycle,
    /// Reading database metadata failed.
    #[error("catalog access failed")]
    CatalogAccess,
    /// The advisory install lock could not be taken.
    #[error("install lock unavailable")]
    Lock,
    /// Filesystem access failed.
    #[error("i/o error")]
    Io,
    /// Not a failure: the user asked for a dry run or for help.
    #[error("user request")]
    UserRequest,
}

/// The execution context in which an error occurred. Context may live inside
/// pgpkg structures, but can also be found within stored procedures at
/// runtime, so it is independent of the object that raised the error.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Full source text of the failing code.
    pub source: String,
    /// 1-based line within `source`.
    pub line: usize,
    /// Human-readable location of the frame.
    pub location: String,
    /// Further frames, innermost last.
    pub next: Option<Box<ErrorContext>>,
}

impl ErrorContext {
    /// Create a single-frame context.
    pub fn new(source: impl Into<String>, line: usize, location: impl Into<String>) -> Self {
        ErrorContext {
            source: source.into(),
            line,
            location: location.into(),
            next: None,
        }
    }

    /// Append a frame to the end of the chain.
    pub fn push(&mut self, frame: ErrorContext) {
        match &mut self.next {
            Some(next) => next.push(frame),
            None => self.next = Some(Box::new(frame)),
        }
    }

    /// Render the failing line with `surround` lines of context either side,
    /// followed by the location of every frame in the chain.
    pub fn render(&self, surround: usize) -> String {
        let mut out = String::new();
        let lines: Vec<&str> = self.source.split('\n').collect();
        let fail = self.line.saturating_sub(1);
        let lo = fail.saturating_sub(surround);
        let hi = (fail + surround).min(lines.len().saturating_sub(1));
        for (ln, text) in lines.iter().enumerate().take(hi + 1).skip(lo) {
            let marker = if ln == fail { "-->" } else { "   " };
            out.push_str(&format!("{} {:4}: {}\n", marker, ln + 1, text));
        }
        let mut frame = Some(self);
        while let Some(f) = frame {
            out.push_str(&f.location);
            out.push('\n');
            frame = f.next.as_deref();
        }
        out
    }
}

/// Anything that can report where it lives: a statement, a unit, a bundle,
/// a package. Used to stamp errors with a `package:unit:line` location.
pub trait Located {
    /// Location string for error reporting.
    fn location(&self) -> String;
}

/// The error type used throughout the engine.
#[derive(Debug)]
pub struct PkgError {
    kind: ErrorKind,
    message: String,
    location: Option<String>,
    context: Option<Box<ErrorContext>>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    siblings: Vec<PkgError>,
}

impl PkgError {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        PkgError {
            kind,
            message: message.into(),
            location: None,
            context: None,
            source: None,
            siblings: Vec::new(),
        }
    }

    /// The distinguished error returned after a clean dry run or `--help`.
    pub fn user_request() -> Self {
        PkgError::new(
            ErrorKind::UserRequest,
            "operation completed, user requested termination",
        )
    }

    /// Stamp the error with the location of `obj`, unless one is already set.
    pub fn at(mut self, obj: &dyn Located) -> Self {
        if self.location.is_none() {
            self.location = Some(obj.location());
        }
        self
    }

    /// Stamp the error with a literal location, unless one is already set.
    pub fn at_location(mut self, location: impl Into<String>) -> Self {
        if self.location.is_none() {
            self.location = Some(location.into());
        }
        self
    }

    /// Attach an execution context chain.
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(Box::new(context));
        self
    }

    /// Wrap an underlying error.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Attach sibling errors (used by `NoProgress` to carry the last error
    /// of every statement that never installed).
    pub fn with_siblings(mut self, siblings: Vec<PkgError>) -> Self {
        self.siblings = siblings;
        self
    }

    /// The error's kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The error's location, if stamped.
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    /// The attached context chain, if any.
    pub fn context(&self) -> Option<&ErrorContext> {
        self.context.as_deref()
    }

    /// Sibling errors carried alongside this one.
    pub fn siblings(&self) -> &[PkgError] {
        &self.siblings
    }

    /// True for the distinguished user-request outcome, which callers report
    /// as success.
    pub fn is_user_request(&self) -> bool {
        self.kind == ErrorKind::UserRequest
    }

    /// Follow wrapped errors down to the innermost `PkgError`.
    pub fn root(&self) -> &PkgError {
        let mut last = self;
        let mut err: Option<&(dyn std::error::Error + 'static)> =
            std::error::Error::source(self);
        while let Some(e) = err {
            if let Some(pkg) = e.downcast_ref::<PkgError>() {
                last = pkg;
            }
            err = e.source();
        }
        last
    }

    /// Render the innermost error with its context frames, the way the CLI
    /// reports failures.
    pub fn render_root(&self, surround: usize) -> String {
        let root = self.root();
        let mut out = format!("{}\n", root);
        if let Some(ctx) = root.context() {
            out.push_str(&ctx.render(surround));
        }
        for sibling in root.siblings() {
            out.push_str(&format!("{}\n", sibling));
        }
        out
    }
}

impl fmt::Display for PkgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(location) = &self.location {
            write!(f, "{}: ", location)?;
        }
        write!(f, "{}", self.message)?;
        if let Some(source) = &self.source {
            write!(f, ": {}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for PkgError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for PkgError {
    fn from(err: std::io::Error) -> Self {
        PkgError::new(ErrorKind::Io, "i/o error").with_source(err)
    }
}

impl From<sqlx::Error> for PkgError {
    fn from(err: sqlx::Error) -> Self {
        PkgError::new(ErrorKind::CatalogAccess, "database error").with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct At(&'static str);

    impl Located for At {
        fn location(&self) -> String {
            self.0.to_string()
        }
    }

    #[test]
    fn display_includes_location_and_source() {
        let err =
            PkgError::new(ErrorKind::Parse, "unexpected token").at(&At("demo:api/users.sql:12"));
        assert_eq!(err.to_string(), "demo:api/users.sql:12: unexpected token");

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = PkgError::new(ErrorKind::Io, "unable to open unit")
            .at(&At("demo:api/users.sql"))
            .with_source(io);
        assert_eq!(
            err.to_string(),
            "demo:api/users.sql: unable to open unit: gone"
        );
    }

    #[test]
    fn at_keeps_first_location() {
        let err = PkgError::new(ErrorKind::Parse, "boom")
            .at(&At("inner:1"))
            .at(&At("outer:2"));
        assert_eq!(err.location(), Some("inner:1"));
    }

    #[test]
    fn root_follows_wrapped_errors() {
        let inner = PkgError::new(ErrorKind::ExecRuntime, "function does not exist")
            .at(&At("demo:api/f.sql:3"));
        let outer = PkgError::new(ErrorKind::NoProgress, "unable to install managed objects")
            .with_source(inner);
        assert_eq!(outer.root().location(), Some("demo:api/f.sql:3"));
    }

    #[test]
    fn context_renders_failing_line() {
        let ctx = ErrorContext::new("select 1;\nselect boom();\nselect 3;", 2, "demo:t.sql:2");
        let rendered = ctx.render(1);
        assert!(rendered.contains("-->    2: select boom();"));
        assert!(rendered.contains("    1: select 1;"));
        assert!(rendered.contains("demo:t.sql:2"));
    }

    #[test]
    fn context_chain_appends() {
        let mut ctx = ErrorContext::new("a", 1, "outer");
        ctx.push(ErrorContext::new("b", 1, "inner"));
        assert_eq!(ctx.next.as_ref().unwrap().location, "inner");
    }
}
