//! Test support: a small arithmetic language context and query helpers.
//!
//! `mini` understands numbers, identifiers, `+ - * /`, parentheses, unary
//! minus, and a `sum(...)` builtin that flattens arrays and tables. An
//! optional `name =` prefix declares the cell's output; the prefix registers
//! even when the remaining expression fails to parse, so dependents can see
//! the producer while it is broken.

use std::cell::Cell as Slot;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use serde_json::{json, Value};

use crate::context::{
    CompileOutput, CompileRequest, Diagnostic, ExecuteOutput, ExecuteRequest, LanguageContext,
};
use crate::engine::Engine;
use crate::error::ErrorKind;
use crate::symbol;

const BUILTINS: &[&str] = &["sum"];

/// Call counters shared between a test and its registered context.
#[derive(Debug, Default)]
pub struct MiniStats {
    pub compiled: Slot<usize>,
    pub executed: Slot<usize>,
}

/// The `mini` language context.
#[derive(Default)]
pub struct MiniContext {
    pub stats: Rc<MiniStats>,
}

impl MiniContext {
    pub fn shared() -> (Self, Rc<MiniStats>) {
        let stats = Rc::new(MiniStats::default());
        (MiniContext { stats: Rc::clone(&stats) }, stats)
    }
}

impl LanguageContext for MiniContext {
    fn compile(&mut self, request: CompileRequest<'_>) -> CompileOutput {
        self.stats.compiled.set(self.stats.compiled.get() + 1);
        let (output, body, offset) = split_assignment(request.code);
        let mut out = CompileOutput::default();
        if let Some(name) = output {
            out.outputs.push(name.to_string());
        }
        match lex(body, offset) {
            Ok(tokens) => {
                for token in &tokens {
                    if let TokenKind::Ident(name) = &token.kind {
                        if !BUILTINS.contains(&name.as_str())
                            && !out.inputs.iter().any(|i| i == name)
                        {
                            out.inputs.push(name.clone());
                        }
                    }
                }
                let mut parser = Parser::new(tokens, None);
                if let Err(diag) = parser.check() {
                    out.messages.push(diag);
                }
            }
            Err(diag) => out.messages.push(diag),
        }
        out
    }

    fn execute(&mut self, request: ExecuteRequest<'_>) -> ExecuteOutput {
        self.stats.executed.set(self.stats.executed.get() + 1);
        let (_, body, offset) = split_assignment(request.code);
        let env: FxHashMap<String, Value> = request.inputs.into_iter().collect();
        match lex(body, offset) {
            Ok(tokens) => {
                let mut parser = Parser::new(tokens, Some(&env));
                match parser.evaluate() {
                    Ok(value) => ExecuteOutput { value: Some(value), messages: Vec::new() },
                    Err(diag) => ExecuteOutput { value: None, messages: vec![diag] },
                }
            }
            Err(diag) => ExecuteOutput { value: None, messages: vec![diag] },
        }
    }
}

/// A context whose availability a test can flip off and on.
pub struct FlakyContext {
    inner: MiniContext,
    available: Rc<Slot<bool>>,
}

impl FlakyContext {
    pub fn new() -> (Self, Rc<Slot<bool>>) {
        let available = Rc::new(Slot::new(true));
        let context = FlakyContext {
            inner: MiniContext::default(),
            available: Rc::clone(&available),
        };
        (context, available)
    }
}

impl LanguageContext for FlakyContext {
    fn compile(&mut self, request: CompileRequest<'_>) -> CompileOutput {
        self.inner.compile(request)
    }

    fn execute(&mut self, request: ExecuteRequest<'_>) -> ExecuteOutput {
        self.inner.execute(request)
    }

    fn available(&self) -> bool {
        self.available.get()
    }
}

/// An engine with `mini` registered.
pub fn mini_engine() -> Engine {
    let mut engine = Engine::new();
    engine.register_context("mini", Box::new(MiniContext::default()));
    engine
}

pub fn status(engine: &Engine, id: &str) -> String {
    engine
        .cell(id)
        .map(|c| c.display_status().to_string())
        .unwrap_or_else(|| "missing".to_string())
}

pub fn value_of(engine: &Engine, id: &str) -> Value {
    engine
        .cell(id)
        .and_then(|c| c.value.clone())
        .unwrap_or(Value::Null)
}

pub fn error_kinds(engine: &Engine, id: &str) -> Vec<ErrorKind> {
    engine
        .cell(id)
        .map(|c| c.errors.iter().map(|e| e.kind).collect())
        .unwrap_or_default()
}

/// Qualified id of the sheet cell at a coordinate label.
pub fn sheet_cell_id(engine: &Engine, sheet_id: &str, label: &str) -> String {
    let (row, col) = symbol::parse_cell_label(label).unwrap_or((0, 0));
    engine
        .cell_ids()
        .into_iter()
        .find(|id| {
            engine
                .cell(id)
                .map(|c| c.doc_id == sheet_id && c.position == Some((row, col)))
                .unwrap_or(false)
        })
        .unwrap_or_else(|| symbol::qualified_id(sheet_id, label))
}

// =============================================================================
// The mini expression language
// =============================================================================

fn split_assignment(code: &str) -> (Option<&str>, &str, usize) {
    match symbol::expression_cell(code) {
        Some((name, prefix_len)) => (name, &code[prefix_len..], prefix_len),
        None => (None, code, 0),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    pos: usize,
}

fn lex(code: &str, offset: usize) -> Result<Vec<Token>, Diagnostic> {
    let bytes = code.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        let pos = offset + i;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                tokens.push(Token { kind: TokenKind::Plus, pos });
                i += 1;
            }
            '-' => {
                tokens.push(Token { kind: TokenKind::Minus, pos });
                i += 1;
            }
            '*' => {
                tokens.push(Token { kind: TokenKind::Star, pos });
                i += 1;
            }
            '/' => {
                tokens.push(Token { kind: TokenKind::Slash, pos });
                i += 1;
            }
            '(' => {
                tokens.push(Token { kind: TokenKind::LParen, pos });
                i += 1;
            }
            ')' => {
                tokens.push(Token { kind: TokenKind::RParen, pos });
                i += 1;
            }
            ',' => {
                tokens.push(Token { kind: TokenKind::Comma, pos });
                i += 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_digit() || bytes[i] == b'.')
                {
                    i += 1;
                }
                let text = &code[start..i];
                let num: f64 = text
                    .parse()
                    .map_err(|_| Diagnostic::at(format!("bad number '{text}'"), pos))?;
                tokens.push(Token { kind: TokenKind::Num(num), pos });
            }
            c if c == '_' || c.is_ascii_alphabetic() => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i] == b'_' || bytes[i].is_ascii_alphanumeric())
                {
                    i += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Ident(code[start..i].to_string()),
                    pos,
                });
            }
            c => {
                return Err(Diagnostic::at(format!("unexpected character '{c}'"), pos));
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    idx: usize,
    env: Option<&'a FxHashMap<String, Value>>,
}

impl<'a> Parser<'a> {
    fn new(tokens: Vec<Token>, env: Option<&'a FxHashMap<String, Value>>) -> Self {
        Parser { tokens, idx: 0, env }
    }

    /// Syntax-only pass: every identifier resolves to zero.
    fn check(&mut self) -> Result<(), Diagnostic> {
        self.evaluate().map(|_| ())
    }

    fn evaluate(&mut self) -> Result<Value, Diagnostic> {
        let result = self.expr()?;
        match self.tokens.get(self.idx) {
            Some(t) => Err(Diagnostic::at("trailing input", t.pos)),
            None => Ok(number(result)),
        }
    }

    fn expr(&mut self) -> Result<f64, Diagnostic> {
        let mut acc = self.term()?;
        loop {
            match self.tokens.get(self.idx).map(|t| t.kind.clone()) {
                Some(TokenKind::Plus) => {
                    self.idx += 1;
                    acc += self.term()?;
                }
                Some(TokenKind::Minus) => {
                    self.idx += 1;
                    acc -= self.term()?;
                }
                _ => return Ok(acc),
            }
        }
    }

    fn term(&mut self) -> Result<f64, Diagnostic> {
        let mut acc = self.factor()?;
        loop {
            match self.tokens.get(self.idx).map(|t| t.kind.clone()) {
                Some(TokenKind::Star) => {
                    self.idx += 1;
                    acc *= self.factor()?;
                }
                Some(TokenKind::Slash) => {
                    let pos = self.tokens[self.idx].pos;
                    self.idx += 1;
                    let rhs = self.factor()?;
                    // in the syntax-only pass identifiers read as zero, so
                    // the check applies only when actually evaluating
                    if self.env.is_some() && rhs == 0.0 {
                        return Err(Diagnostic::at("division by zero", pos));
                    }
                    acc /= rhs;
                }
                _ => return Ok(acc),
            }
        }
    }

    fn factor(&mut self) -> Result<f64, Diagnostic> {
        let token = match self.tokens.get(self.idx).cloned() {
            Some(t) => t,
            None => {
                let pos = self.tokens.last().map_or(0, |t| t.pos);
                return Err(Diagnostic::at("expected expression", pos));
            }
        };
        self.idx += 1;
        match token.kind {
            TokenKind::Num(n) => Ok(n),
            TokenKind::Minus => Ok(-self.factor()?),
            TokenKind::LParen => {
                let inner = self.expr()?;
                self.expect_rparen(token.pos)?;
                Ok(inner)
            }
            TokenKind::Ident(name) => {
                if matches!(
                    self.tokens.get(self.idx).map(|t| &t.kind),
                    Some(TokenKind::LParen)
                ) {
                    self.idx += 1;
                    self.call(&name, token.pos)
                } else {
                    self.lookup(&name, token.pos)
                }
            }
            _ => Err(Diagnostic::at("expected expression", token.pos)),
        }
    }

    fn call(&mut self, name: &str, pos: usize) -> Result<f64, Diagnostic> {
        let mut args = Vec::new();
        if !matches!(
            self.tokens.get(self.idx).map(|t| &t.kind),
            Some(TokenKind::RParen)
        ) {
            loop {
                args.push(self.arg()?);
                match self.tokens.get(self.idx).map(|t| t.kind.clone()) {
                    Some(TokenKind::Comma) => self.idx += 1,
                    _ => break,
                }
            }
        }
        self.expect_rparen(pos)?;
        match name {
            "sum" => {
                let mut total = 0.0;
                for arg in &args {
                    total += sum_value(arg)
                        .map_err(|message| Diagnostic::at(message, pos))?;
                }
                Ok(total)
            }
            _ => Err(Diagnostic::at(format!("unknown function '{name}'"), pos)),
        }
    }

    /// One call argument; identifiers keep their full value so `sum` can see
    /// arrays and tables.
    fn arg(&mut self) -> Result<Value, Diagnostic> {
        if let Some(Token { kind: TokenKind::Ident(name), pos }) =
            self.tokens.get(self.idx).cloned()
        {
            let next = self.tokens.get(self.idx + 1).map(|t| &t.kind);
            let ends_arg = matches!(next, Some(TokenKind::Comma) | Some(TokenKind::RParen));
            if ends_arg {
                self.idx += 1;
                return self.lookup_value(&name, pos);
            }
        }
        Ok(number(self.expr()?))
    }

    fn lookup(&mut self, name: &str, pos: usize) -> Result<f64, Diagnostic> {
        let value = self.lookup_value(name, pos)?;
        value
            .as_f64()
            .ok_or_else(|| Diagnostic::at(format!("'{name}' is not a number"), pos))
    }

    fn lookup_value(&mut self, name: &str, pos: usize) -> Result<Value, Diagnostic> {
        match self.env {
            None => Ok(json!(0)),
            Some(env) => env
                .get(name)
                .cloned()
                .ok_or_else(|| Diagnostic::at(format!("unknown identifier '{name}'"), pos)),
        }
    }

    fn expect_rparen(&mut self, open_pos: usize) -> Result<(), Diagnostic> {
        match self.tokens.get(self.idx).map(|t| t.kind.clone()) {
            Some(TokenKind::RParen) => {
                self.idx += 1;
                Ok(())
            }
            _ => Err(Diagnostic::at("unclosed parenthesis", open_pos)),
        }
    }
}

fn sum_value(value: &Value) -> Result<f64, String> {
    match value {
        Value::Null => Ok(0.0),
        Value::Number(n) => n.as_f64().ok_or_else(|| "bad number".to_string()),
        Value::Array(items) => {
            let mut total = 0.0;
            for item in items {
                total += sum_value(item)?;
            }
            Ok(total)
        }
        Value::Object(map) => {
            let data = map
                .get("data")
                .and_then(|d| d.as_object())
                .ok_or_else(|| "cannot sum this value".to_string())?;
            let mut total = 0.0;
            for column in data.values() {
                total += sum_value(column)?;
            }
            Ok(total)
        }
        _ => Err("cannot sum this value".to_string()),
    }
}

/// Renders a float back as a JSON number, as an integer when exact.
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        json!(n as i64)
    } else {
        json!(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CompileRequest, ExecuteRequest};

    fn compile(code: &str) -> CompileOutput {
        MiniContext::default().compile(CompileRequest {
            id: "doc1!c1",
            code,
            lang: "mini",
            range_expressions_allowed: false,
        })
    }

    fn execute(code: &str, inputs: Vec<(String, Value)>) -> ExecuteOutput {
        MiniContext::default().execute(ExecuteRequest {
            id: "doc1!c1",
            code,
            lang: "mini",
            inputs,
        })
    }

    #[test]
    fn test_compile_collects_inputs_and_output() {
        let out = compile("y = a + b * 2");
        assert_eq!(out.outputs, vec!["y".to_string()]);
        assert_eq!(out.inputs, vec!["a".to_string(), "b".to_string()]);
        assert!(out.messages.is_empty());
    }

    #[test]
    fn test_compile_excludes_builtins() {
        let out = compile("sum(A1_A4)");
        assert_eq!(out.inputs, vec!["A1_A4".to_string()]);
    }

    #[test]
    fn test_output_survives_broken_body() {
        let out = compile("y = 1 +");
        assert_eq!(out.outputs, vec!["y".to_string()]);
        assert_eq!(out.messages.len(), 1);
    }

    #[test]
    fn test_execute_arithmetic() {
        let out = execute("x = a * (2 + b)", vec![
            ("a".to_string(), json!(3)),
            ("b".to_string(), json!(1)),
        ]);
        assert_eq!(out.value, Some(json!(9)));
    }

    #[test]
    fn test_execute_sum_of_array() {
        let out = execute("sum(xs) + 1", vec![("xs".to_string(), json!([1, 2, 3]))]);
        assert_eq!(out.value, Some(json!(7)));
    }

    #[test]
    fn test_execute_unknown_identifier() {
        let out = execute("a + 1", vec![]);
        assert!(out.value.is_none());
        assert!(out.messages[0].message.contains("unknown identifier"));
    }

    #[test]
    fn test_division_by_zero() {
        let out = execute("1 / 0", vec![]);
        assert!(out.value.is_none());
        assert_eq!(out.messages[0].message, "division by zero");
    }
}
