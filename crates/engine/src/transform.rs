//! Structural-edit transformations.
//!
//! Inserting or deleting rows/columns must rewrite every cell/range symbol
//! that overlaps or follows the edit along the edited dimension, in every
//! registered cell anywhere in the engine. The rewrite happens in two steps:
//! changes are first *recorded* per symbol (so positions stay valid while
//! other symbols of the same cell are examined), then *applied* in a single
//! pass ordered by start position, with a running offset correcting later
//! symbols for length changes introduced by earlier replacements.
//!
//! After `apply_edits` returns, every symbol's stored `start..end` again
//! exactly matches its literal text inside the rewritten source.

use crate::cell::CellSource;
use crate::symbol::{self, Rect, SymbolKind, BROKEN_REF};

/// The dimension a structural edit operates along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dim {
    Row,
    Col,
}

/// Outcome of shifting one rect through an insert or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanChange {
    /// The rect is unaffected.
    Unchanged,
    /// The rect moved or resized.
    Moved(Rect),
    /// The rect fell entirely inside a deleted region.
    Broken,
}

/// Shifts `rect` through an edit of `count` rows/columns at `pos`.
///
/// Positive `count` inserts before index `pos`; negative `count` deletes the
/// region `[pos, pos - count)`. A rect partially covered by a deletion is
/// clipped to its surviving boundary; a rect fully covered becomes `Broken`.
pub fn transform_rect(rect: &Rect, dim: Dim, pos: usize, count: i64) -> SpanChange {
    let (start, end) = match dim {
        Dim::Row => (rect.start_row, rect.end_row),
        Dim::Col => (rect.start_col, rect.end_col),
    };

    let (new_start, new_end) = if count > 0 {
        let n = count as usize;
        if pos <= start {
            (start + n, end + n)
        } else if pos <= end {
            (start, end + n)
        } else {
            (start, end)
        }
    } else {
        let n = (-count) as usize;
        let new_start = if start >= pos + n {
            start - n
        } else if start >= pos {
            pos
        } else {
            start
        };
        let new_end = if end >= pos + n {
            end - n
        } else if end >= pos {
            if pos == 0 {
                return SpanChange::Broken;
            }
            pos - 1
        } else {
            end
        };
        if new_end < new_start {
            return SpanChange::Broken;
        }
        (new_start, new_end)
    };

    if new_start == start && new_end == end {
        return SpanChange::Unchanged;
    }
    let moved = match dim {
        Dim::Row => Rect { start_row: new_start, end_row: new_end, ..*rect },
        Dim::Col => Rect { start_col: new_start, end_col: new_end, ..*rect },
    };
    SpanChange::Moved(moved)
}

/// A recorded change to one symbol of a cell, by index into its symbol list.
#[derive(Debug, Clone)]
pub struct SymbolEdit {
    pub index: usize,
    pub kind: EditKind,
}

#[derive(Debug, Clone)]
pub enum EditKind {
    /// The symbol now refers to a different rect; its coordinate label is
    /// rewritten (and normalized in the process).
    Reposition(Rect),
    /// The symbol's target was destroyed; its text becomes the broken
    /// reference sentinel.
    Break,
    /// The symbol's scope is renamed (resource rename).
    Rescope(String),
}

/// Formats a scope for inclusion in source text, quoting it when it is not
/// identifier-safe.
pub fn format_scope(scope: &str) -> String {
    let mut chars = scope.chars();
    let safe = match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {
            chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
        }
        _ => false,
    };
    if safe {
        scope.to_string()
    } else {
        format!("'{scope}'")
    }
}

/// Applies recorded edits to a cell's source, updating original text,
/// transpiled text, and every symbol's position in one pass.
///
/// Returns true if any text changed.
pub fn apply_edits(source: &mut CellSource, mut edits: Vec<SymbolEdit>) -> bool {
    if edits.is_empty() {
        return false;
    }
    edits.sort_by_key(|e| source.symbols[e.index].start);

    let mut original = source.original.clone();
    let mut transpiled = source.transpiled.clone();
    let mut offset: i64 = 0;
    let mut changed = false;
    let mut edit_iter = edits.into_iter().peekable();

    // walk symbols in text order, shifting positions as replacements land
    let mut order: Vec<usize> = (0..source.symbols.len()).collect();
    order.sort_by_key(|&i| source.symbols[i].start);

    for i in order {
        let sym = &mut source.symbols[i];
        sym.start = (sym.start as i64 + offset) as usize;
        sym.end = (sym.end as i64 + offset) as usize;

        let edit = match edit_iter.peek() {
            Some(e) if e.index == i => edit_iter.next().map(|e| e.kind),
            _ => None,
        };
        let Some(kind) = edit else { continue };

        let scope_prefix = match &kind {
            EditKind::Rescope(new_scope) => match &sym.scope {
                Some(_) => {
                    let prefix = format!("{}!", format_scope(new_scope));
                    sym.scope = Some(new_scope.clone());
                    prefix
                }
                None => String::new(),
            },
            // keep whatever scope prefix the symbol already carries
            _ => sym.text[..sym.text.len() - sym.name.len()].to_string(),
        };

        let new_text = match &kind {
            EditKind::Reposition(rect) => {
                let label = symbol::rect_label(rect);
                sym.kind = if rect.is_cell() { SymbolKind::Cell } else { SymbolKind::Range };
                sym.name = label.clone();
                sym.rect = Some(*rect);
                format!("{scope_prefix}{label}")
            }
            EditKind::Break => {
                sym.kind = SymbolKind::Var;
                sym.name = BROKEN_REF.trim_start_matches('#').to_string();
                sym.scope = None;
                sym.rect = None;
                BROKEN_REF.to_string()
            }
            EditKind::Rescope(_) => format!("{scope_prefix}{}", sym.name),
        };

        let old_len = sym.end - sym.start;
        let new_mangled = symbol::to_identifier(&new_text);
        original.replace_range(sym.start..sym.end, &new_text);
        transpiled.replace_range(sym.start..sym.end, &new_mangled);

        sym.end = sym.start + new_text.len();
        offset += new_text.len() as i64 - old_len as i64;
        sym.text = new_text;
        sym.mangled = new_mangled;
        changed = true;
    }

    source.original = original;
    source.transpiled = transpiled;
    changed
}
