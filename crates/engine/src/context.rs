//! The boundary to external language contexts.
//!
//! The engine never interprets cell code itself; it hands transpiled code to
//! a per-language context for static analysis (`compile`) and evaluation
//! (`execute`). Contexts are synchronous trait objects here, but the
//! scheduler folds every response into the next cycle's actions, so the
//! two-phase dispatch/integrate protocol is preserved regardless.

use serde_json::Value;

use rustc_hash::FxHashMap;

/// A diagnostic reported by a context, positioned against the transpiled
/// code (and therefore, by the length-preserving mangling, against the
/// original source as well).
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub message: String,
    pub position: Option<usize>,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Diagnostic { message: message.into(), position: None }
    }

    pub fn at(message: impl Into<String>, position: usize) -> Self {
        Diagnostic { message: message.into(), position: Some(position) }
    }
}

/// Static-analysis request.
#[derive(Debug)]
pub struct CompileRequest<'a> {
    pub id: &'a str,
    pub code: &'a str,
    pub lang: &'a str,
    /// Sheet expression cells may consist of a bare range expression;
    /// document cells may not.
    pub range_expressions_allowed: bool,
}

/// Static-analysis result: declared inputs and outputs, plus any syntax
/// diagnostics. Identifier names refer to the transpiled code.
#[derive(Debug, Clone, Default)]
pub struct CompileOutput {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub messages: Vec<Diagnostic>,
    /// Whether evaluation has effects beyond producing the value.
    pub has_side_effects: bool,
}

/// Evaluation request, carrying the resolved value of every input.
#[derive(Debug)]
pub struct ExecuteRequest<'a> {
    pub id: &'a str,
    pub code: &'a str,
    pub lang: &'a str,
    pub inputs: Vec<(String, Value)>,
}

/// Evaluation result. `value` is `None` when evaluation failed.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOutput {
    pub value: Option<Value>,
    pub messages: Vec<Diagnostic>,
}

/// Per-language execution context.
pub trait LanguageContext {
    fn compile(&mut self, request: CompileRequest<'_>) -> CompileOutput;
    fn execute(&mut self, request: ExecuteRequest<'_>) -> ExecuteOutput;

    /// A context may become unreachable (e.g. a remote peer going away);
    /// cells of its language then get a `context` error instead of being
    /// parked forever.
    fn available(&self) -> bool {
        true
    }
}

/// Dispatches to the registered context for a cell's language.
#[derive(Default)]
pub struct CompositeContext {
    contexts: FxHashMap<String, Box<dyn LanguageContext>>,
}

impl CompositeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, lang: &str, context: Box<dyn LanguageContext>) {
        self.contexts.insert(lang.to_string(), context);
    }

    /// Returns the context for `lang`, or `None` if there is none or it is
    /// currently unavailable.
    pub fn get_mut(&mut self, lang: &str) -> Option<&mut Box<dyn LanguageContext>> {
        self.contexts.get_mut(lang).filter(|c| c.available())
    }
}
