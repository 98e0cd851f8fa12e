//! Error types for cells and the engine surface.
//!
//! `CellError` is a structured diagnostic attached to a cell; it never crosses
//! the engine's public API as a `Result` error. `EngineError` covers API
//! misuse (unknown ids, wrong resource kind) and is what fallible engine
//! methods return.

use std::fmt;

use serde::Serialize;

/// Classification of a cell diagnostic.
///
/// The graph-owned kinds (`Collision`, `Cyclic`, `Unresolved`) are re-derived
/// on every graph update and cannot be cleared by a local edit that does not
/// actually resolve the condition. The remaining kinds are cleared by the
/// scheduler at the start of each analyse/evaluate attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Reported by a language context during compilation.
    Syntax,
    /// No language context available for the cell's language.
    Context,
    /// Two or more cells in the same resource declare the same output.
    Collision,
    /// The cell participates in a circular dependency.
    Cyclic,
    /// An input has no producing cell, grid slot, or global.
    Unresolved,
    /// Raised by the context during evaluation.
    Runtime,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Syntax => "syntax",
            ErrorKind::Context => "context",
            ErrorKind::Collision => "collision",
            ErrorKind::Cyclic => "cyclic",
            ErrorKind::Unresolved => "unresolved",
            ErrorKind::Runtime => "runtime",
        }
    }

    /// True for kinds that only the graph may attach or clear.
    pub fn graph_owned(&self) -> bool {
        matches!(
            self,
            ErrorKind::Collision | ErrorKind::Cyclic | ErrorKind::Unresolved
        )
    }
}

/// A structured diagnostic attached to one cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellError {
    pub kind: ErrorKind,
    pub message: String,
    /// Character offset into the cell's source, when the context reported one.
    /// Valid against both original and transpiled text since mangling is
    /// length-preserving.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

impl CellError {
    pub fn syntax(message: impl Into<String>, position: Option<usize>) -> Self {
        CellError { kind: ErrorKind::Syntax, message: message.into(), position }
    }

    pub fn context(lang: &str) -> Self {
        CellError {
            kind: ErrorKind::Context,
            message: format!("no context available for language '{lang}'"),
            position: None,
        }
    }

    pub fn collision(name: &str) -> Self {
        CellError {
            kind: ErrorKind::Collision,
            message: format!("output '{name}' is declared by more than one cell"),
            position: None,
        }
    }

    pub fn cyclic() -> Self {
        CellError {
            kind: ErrorKind::Cyclic,
            message: "cell is part of a circular dependency".to_string(),
            position: None,
        }
    }

    pub fn unresolved(name: &str) -> Self {
        CellError {
            kind: ErrorKind::Unresolved,
            message: format!("could not resolve input '{name}'"),
            position: None,
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        CellError { kind: ErrorKind::Runtime, message: message.into(), position: None }
    }
}

impl fmt::Display for CellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for CellError {}

/// API misuse errors returned by engine methods.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// No resource with this id.
    UnknownResource(String),
    /// No cell with this id in the addressed resource.
    UnknownCell(String),
    /// A resource with this id already exists.
    DuplicateResource(String),
    /// A sheet operation was addressed to a document, or vice versa.
    WrongResourceKind { id: String, expected: &'static str },
    /// A structural edit addressed a position outside the grid.
    OutOfBounds { id: String, pos: usize },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::UnknownResource(id) => write!(f, "unknown resource '{id}'"),
            EngineError::UnknownCell(id) => write!(f, "unknown cell '{id}'"),
            EngineError::DuplicateResource(id) => {
                write!(f, "resource '{id}' already exists")
            }
            EngineError::WrongResourceKind { id, expected } => {
                write!(f, "resource '{id}' is not a {expected}")
            }
            EngineError::OutOfBounds { id, pos } => {
                write!(f, "position {pos} is outside resource '{id}'")
            }
        }
    }
}

impl std::error::Error for EngineError {}
