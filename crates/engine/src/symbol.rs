//! Reference extraction and length-preserving mangling.
//!
//! Cells reference each other with expressions like `x`, `A1`, `A1:B10`,
//! or scoped ("transcluded") forms such as `doc1!x` and `'My Sheet'!A1:B10`.
//! Before a cell's code is handed to a language context, every reference is
//! rewritten to an identifier-safe token of *identical length*, so character
//! offsets reported against the transpiled code are valid against the
//! original source.

use std::sync::OnceLock;

use regex::Regex;

/// Sentinel written into source text when a structural edit destroys the
/// target of a reference.
pub const BROKEN_REF: &str = "#BROKEN_REF";

/// What a reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    /// A named variable, e.g. `x` or `doc1!x`.
    Var,
    /// A single sheet coordinate, e.g. `A1`.
    Cell,
    /// A rectangular coordinate range, e.g. `A1:B10`.
    Range,
}

/// Normalized rectangular span of a cell or range symbol (0-based, inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub start_row: usize,
    pub start_col: usize,
    pub end_row: usize,
    pub end_col: usize,
}

impl Rect {
    pub fn cell(row: usize, col: usize) -> Self {
        Rect { start_row: row, start_col: col, end_row: row, end_col: col }
    }

    pub fn is_cell(&self) -> bool {
        self.start_row == self.end_row && self.start_col == self.end_col
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        row >= self.start_row && row <= self.end_row && col >= self.start_col && col <= self.end_col
    }
}

/// One extracted reference occurrence inside a cell's source text.
///
/// Positions are byte offsets into the original source; since reference text
/// is ASCII and mangling is one-for-one, the same offsets are valid in the
/// transpiled text.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub kind: SymbolKind,
    /// Local name: `x`, `A1`, `A1:B10` (as written, unnormalized).
    pub name: String,
    /// Scope as written, without quotes: `doc1`, `My Sheet`.
    pub scope: Option<String>,
    /// The full matched text, including scope and quotes.
    pub text: String,
    /// Identifier-safe replacement, same length as `text`.
    pub mangled: String,
    pub start: usize,
    pub end: usize,
    /// Normalized span for `Cell`/`Range` symbols.
    pub rect: Option<Rect>,
    /// Resolved target document id. Filled in at registration time; `None`
    /// until then, or when the scope does not name a known resource.
    pub target: Option<String>,
}

impl Symbol {
    /// Key under which language contexts report this symbol as an input.
    ///
    /// Mangled quoted-scope symbols carry a leading space (see
    /// [`to_identifier`]); the identifier seen by the context starts after it.
    pub fn mapping_key(&self) -> &str {
        self.mangled.trim_start()
    }

    /// Qualified id of the referenced producer, e.g. `doc1!x`.
    ///
    /// Only meaningful once `target` is resolved.
    pub fn qualified_id(&self) -> Option<String> {
        self.target.as_ref().map(|t| qualified_id(t, &self.name))
    }
}

/// Derives a globally unique id from a resource id and a local name.
pub fn qualified_id(doc_id: &str, local: &str) -> String {
    format!("{doc_id}!{local}")
}

const ID: &str = "([_A-Za-z][_A-Za-z0-9]*)";
const NAME: &str = "[']([^']+)[']";
const CELL_ID: &str = "([A-Z]+[1-9][0-9]*)";

fn ref_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // ( ( \b ID | '...' )! | \b )( CELL_ID(:CELL_ID)? | ID )
        let pattern = format!(
            "(?:(?:(?:\\b{ID}|{NAME})[!])|\\b)(?:{CELL_ID}(?:[:]{CELL_ID})?|{ID})"
        );
        Regex::new(&pattern).expect("reference pattern is valid")
    })
}

fn expression_cell_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(&format!("^\\s*{ID}?\\s*=")).expect("expression pattern is valid"))
}

/// Detects whether a sheet cell is an expression (as opposed to a constant).
///
/// Returns `(output_name, prefix_len)`: the optional `x` of an `x = ...`
/// alias, and the length of the matched prefix up to and including the `=`.
pub fn expression_cell(source: &str) -> Option<(Option<&str>, usize)> {
    let caps = expression_cell_regex().captures(source)?;
    let whole = caps.get(0).expect("group 0 always present");
    Some((caps.get(1).map(|m| m.as_str()), whole.end()))
}

/// Scans source text left-to-right for reference expressions.
pub fn extract_symbols(code: &str) -> Vec<Symbol> {
    let mut symbols = Vec::new();
    for caps in ref_regex().captures_iter(code) {
        let whole = caps.get(0).expect("group 0 always present");
        let text = whole.as_str();
        let scope = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str().to_string());
        let anchor = caps.get(3).map(|m| m.as_str());
        let focus = caps.get(4).map(|m| m.as_str());
        let var_name = caps.get(5).map(|m| m.as_str());

        let (kind, name, rect) = match (anchor, focus, var_name) {
            (Some(anchor), Some(focus), _) if focus != anchor => {
                let (ar, ac) = parse_cell_label(anchor).expect("matched cell label");
                let (fr, fc) = parse_cell_label(focus).expect("matched cell label");
                // inverted ranges are normalized: A2:A1 spans the same cells as A1:A2
                let rect = Rect {
                    start_row: ar.min(fr),
                    start_col: ac.min(fc),
                    end_row: ar.max(fr),
                    end_col: ac.max(fc),
                };
                (SymbolKind::Range, format!("{anchor}:{focus}"), Some(rect))
            }
            (Some(anchor), _, _) => {
                let (row, col) = parse_cell_label(anchor).expect("matched cell label");
                (SymbolKind::Cell, anchor.to_string(), Some(Rect::cell(row, col)))
            }
            (None, _, Some(var_name)) => (SymbolKind::Var, var_name.to_string(), None),
            _ => continue,
        };

        symbols.push(Symbol {
            kind,
            name,
            scope,
            mangled: to_identifier(text),
            text: text.to_string(),
            start: whole.start(),
            end: whole.end(),
            rect,
            target: None,
        });
    }
    symbols
}

/// Replaces every character that is invalid in an identifier with `_`,
/// retaining the original length in bytes. A multi-byte character maps to as
/// many underscores as it occupies, so symbol offsets stay valid in both the
/// original and the transpiled text.
///
/// Symbols starting with a tick (quoted scopes) get a leading space instead,
/// separating the transpiled identifier from whatever precedes it.
pub fn to_identifier(text: &str) -> String {
    let mut mangled = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            mangled.push(c);
        } else {
            for _ in 0..c.len_utf8() {
                mangled.push('_');
            }
        }
    }
    if text.starts_with('\'') {
        let mut out = String::with_capacity(mangled.len());
        out.push(' ');
        out.push_str(&mangled[1..]);
        out
    } else {
        mangled
    }
}

/// Rewrites all reference expressions in `code` to identifier-safe tokens.
///
/// Returns the transpiled code together with the extracted symbols (which
/// carry the mangled replacements). The transpiled code always has the exact
/// same length as the input.
pub fn transpile(code: &str) -> (String, Vec<Symbol>) {
    let symbols = extract_symbols(code);
    let mut transpiled = String::with_capacity(code.len());
    let mut cursor = 0;
    for s in &symbols {
        transpiled.push_str(&code[cursor..s.start]);
        transpiled.push_str(&s.mangled);
        cursor = s.end;
    }
    transpiled.push_str(&code[cursor..]);
    debug_assert_eq!(transpiled.len(), code.len());
    (transpiled, symbols)
}

/// Converts a 0-based column index to a spreadsheet letter label:
/// 0=A, 1=B, ..., 25=Z, 26=AA.
pub fn col_letters(col: usize) -> String {
    let mut result = String::new();
    let mut n = col;
    loop {
        result.insert(0, (b'A' + (n % 26) as u8) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    result
}

/// Parses a cell label like `A1` into 0-based `(row, col)`.
pub fn parse_cell_label(label: &str) -> Option<(usize, usize)> {
    let split = label.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = label.split_at(split);
    if letters.is_empty() {
        return None;
    }
    let mut col: usize = 0;
    for c in letters.chars() {
        if !c.is_ascii_uppercase() {
            return None;
        }
        col = col * 26 + (c as usize - 'A' as usize + 1);
    }
    let row: usize = digits.parse().ok()?;
    if row == 0 {
        return None;
    }
    Some((row - 1, col - 1))
}

/// Formats 0-based `(row, col)` as a cell label like `A1`.
pub fn cell_label(row: usize, col: usize) -> String {
    format!("{}{}", col_letters(col), row + 1)
}

/// Formats a rect as a symbol name: `A1` for single cells, `A1:B2` otherwise.
pub fn rect_label(rect: &Rect) -> String {
    let start = cell_label(rect.start_row, rect.start_col);
    if rect.is_cell() {
        start
    } else {
        format!("{}:{}", start, cell_label(rect.end_row, rect.end_col))
    }
}
