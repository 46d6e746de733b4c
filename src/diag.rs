//! Source-located diagnostics shared by every compiler pass.
//!
//! Passes accumulate into a [`Diagnostics`] sink: hard errors stop the
//! pipeline at the end of the failing pass, warnings are collected and
//! logged but never abort.

use std::fmt;

use failure::Fail;

/// A position in a graph source file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceLoc {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl SourceLoc {
    pub fn new(file: &str, line: u32, column: u32) -> Self {
        SourceLoc {
            file: file.to_string(),
            line,
            column,
        }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// The class of a compiler diagnostic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiagKind {
    ParseError,
    UnknownOp,
    UnresolvedReference,
    TypeMismatch,
    ShapeMismatch,
    GraphCycle,
    MaxInlineDepth,
    IoError,
}

impl DiagKind {
    fn name(self) -> &'static str {
        match self {
            DiagKind::ParseError => "parse error",
            DiagKind::UnknownOp => "unknown op",
            DiagKind::UnresolvedReference => "unresolved reference",
            DiagKind::TypeMismatch => "type mismatch",
            DiagKind::ShapeMismatch => "shape mismatch",
            DiagKind::GraphCycle => "graph cycle",
            DiagKind::MaxInlineDepth => "max inline depth",
            DiagKind::IoError => "io error",
        }
    }
}

impl fmt::Display for DiagKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// A single reported message.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub kind: DiagKind,
    pub severity: Severity,
    pub loc: Option<SourceLoc>,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.loc {
            Some(loc) => write!(f, "{}: {}: {}", loc, self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// Accumulating sink handed to every pass.
#[derive(Debug, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
    error_count: usize,
}

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics::default()
    }

    pub fn error(&mut self, kind: DiagKind, loc: Option<SourceLoc>, message: impl Into<String>) {
        let diag = Diagnostic {
            kind,
            severity: Severity::Error,
            loc,
            message: message.into(),
        };
        log::error!("{}", diag);
        self.items.push(diag);
        self.error_count += 1;
    }

    pub fn warn(&mut self, kind: DiagKind, loc: Option<SourceLoc>, message: impl Into<String>) {
        let diag = Diagnostic {
            kind,
            severity: Severity::Warning,
            loc,
            message: message.into(),
        };
        log::warn!("{}", diag);
        self.items.push(diag);
    }

    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    pub fn first_error(&self) -> Option<&Diagnostic> {
        self.items.iter().find(|d| d.severity == Severity::Error)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    /// Converts the sink into `Err` when any error was recorded.
    pub fn into_result(self) -> Result<(), CompileError> {
        if self.has_errors() {
            Err(CompileError {
                diagnostics: self.items,
            })
        } else {
            Ok(())
        }
    }
}

/// Compilation failed; carries every diagnostic recorded up to the failing
/// pass.
#[derive(Debug)]
pub struct CompileError {
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileError {
    pub fn first(&self) -> Option<&Diagnostic> {
        self.diagnostics
            .iter()
            .find(|d| d.severity == Severity::Error)
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let errors = self
            .diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .count();
        match self.first() {
            Some(first) => write!(f, "{} ({} error(s))", first, errors),
            None => write!(f, "compilation failed"),
        }
    }
}

impl Fail for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_gate_the_result() {
        let mut diag = Diagnostics::new();
        diag.warn(DiagKind::UnknownOp, None, "only a warning");
        assert!(!diag.has_errors());
        diag.error(
            DiagKind::ShapeMismatch,
            Some(SourceLoc::new("g.json", 3, 7)),
            "[2] vs [3]",
        );
        assert!(diag.has_errors());
        let err = diag.into_result().unwrap_err();
        let first = err.first().unwrap();
        assert_eq!(first.kind, DiagKind::ShapeMismatch);
        assert_eq!(first.loc.as_ref().unwrap().line, 3);
    }
}
