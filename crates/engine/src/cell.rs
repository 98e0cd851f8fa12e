//! Cell records and the cell state machine.
//!
//! A cell is owned by exactly one resource but lives in the graph's arena,
//! keyed by qualified id. The resource only knows the cell's id and position;
//! state, level, and errors are mutated by the graph and the scheduler.

use serde_json::Value;

use crate::error::{CellError, ErrorKind};
use crate::symbol::{self, Symbol};

/// Raw lifecycle state of a cell.
///
/// `Waiting` vs `Ready` is decided by the graph on every update: a cell is
/// `Ready` once analysed, registered, error-free, and every input has a
/// value; `Waiting` when some input value is still missing. `Running` is
/// observable only between dispatch and integration of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CellState {
    Unknown,
    Analysed,
    Waiting,
    Ready,
    Running,
    Ok,
}

impl CellState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellState::Unknown => "unknown",
            CellState::Analysed => "analysed",
            CellState::Waiting => "waiting",
            CellState::Ready => "ready",
            CellState::Running => "running",
            CellState::Ok => "ok",
        }
    }
}

/// Source text of a cell in both representations.
///
/// Invariant: `transpiled` has the same length as `original`, and every
/// symbol's `start..end` slice of `original` equals its `text` (and of
/// `transpiled` equals its `mangled`).
#[derive(Debug, Clone, Default)]
pub struct CellSource {
    pub original: String,
    pub transpiled: String,
    pub symbols: Vec<Symbol>,
}

impl CellSource {
    pub fn new(original: impl Into<String>) -> Self {
        let original = original.into();
        let (transpiled, symbols) = symbol::transpile(&original);
        CellSource { original, transpiled, symbols }
    }

    /// Source for a constant sheet cell: no extraction, no transpiling.
    pub fn constant(original: impl Into<String>) -> Self {
        let original = original.into();
        CellSource { transpiled: original.clone(), original, symbols: Vec::new() }
    }
}

/// One cell of a document or sheet.
#[derive(Debug, Clone)]
pub struct Cell {
    /// Globally unique id, e.g. `doc1!cell1`.
    pub id: String,
    /// Id local to the owning resource, e.g. `cell1`.
    pub local_id: String,
    /// Id of the owning resource.
    pub doc_id: String,
    pub lang: String,
    pub source: CellSource,

    /// Resolved input symbols, filled in at registration.
    pub inputs: Vec<Symbol>,
    /// Qualified name of the declared output, e.g. `doc1!x`.
    pub output: Option<String>,

    pub state: CellState,
    pub errors: Vec<CellError>,
    pub value: Option<Value>,
    /// Topological level: one greater than the maximum level of the inputs.
    pub level: usize,

    /// Grid position for sheet cells.
    pub position: Option<(usize, usize)>,
    /// True for sheet cells holding a literal rather than an expression.
    pub is_constant: bool,
    pub has_side_effects: bool,

    /// One-shot manual-run unlock, consumed by the next evaluation.
    pub autorun_override: Option<bool>,
    /// Generation token of the most recently issued action; responses
    /// carrying an older token are dropped.
    pub token: u64,
}

impl Cell {
    pub fn new(doc_id: &str, local_id: &str, lang: &str) -> Self {
        Cell {
            id: symbol::qualified_id(doc_id, local_id),
            local_id: local_id.to_string(),
            doc_id: doc_id.to_string(),
            lang: lang.to_string(),
            source: CellSource::default(),
            inputs: Vec::new(),
            output: None,
            state: CellState::Unknown,
            errors: Vec::new(),
            value: None,
            level: 0,
            position: None,
            is_constant: false,
            has_side_effects: false,
            autorun_override: None,
            token: 0,
        }
    }

    /// External status string: any attached error classifies the cell as
    /// `broken`, regardless of its raw state.
    pub fn display_status(&self) -> &'static str {
        if self.errors.is_empty() {
            self.state.as_str()
        } else {
            "broken"
        }
    }

    pub fn has_error(&self, kind: ErrorKind) -> bool {
        self.errors.iter().any(|e| e.kind == kind)
    }

    pub fn clear_errors(&mut self, predicate: impl Fn(&CellError) -> bool) {
        self.errors.retain(|e| !predicate(e));
    }

    /// Clears graph-owned errors; called by the graph before re-deriving them.
    pub fn clear_graph_errors(&mut self) {
        self.clear_errors(|e| e.kind.graph_owned());
    }

    /// Forces full re-analysis after a source or dependency structure change.
    pub fn reset(&mut self) {
        self.state = CellState::Unknown;
        self.value = None;
        self.inputs.clear();
        self.output = None;
        self.clear_errors(|_| true);
    }

    /// Replaces the source text and resets the cell for re-analysis.
    pub fn set_source(&mut self, text: &str, is_expression: bool) {
        self.is_constant = !is_expression;
        self.source = if is_expression {
            CellSource::new(text)
        } else {
            CellSource::constant(text)
        };
        self.reset();
    }

    /// True when the cell may run under the given resource-level autorun
    /// setting. The per-cell override wins when present.
    pub fn may_run(&self, resource_autorun: bool) -> bool {
        self.autorun_override.unwrap_or(resource_autorun)
    }

    /// Issues a fresh generation token, superseding any in-flight action.
    pub fn next_token(&mut self) -> u64 {
        self.token += 1;
        self.token
    }
}
