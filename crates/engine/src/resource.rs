//! Resources: documents (cell sequences) and sheets (cell grids).
//!
//! A resource owns only layout — which cell ids sit where — plus naming and
//! autorun policy. The cells themselves live in the graph's arena; keeping
//! ids here and records there avoids back-pointers between the two.

use serde::{Deserialize, Serialize};

fn default_autorun() -> bool {
    true
}

fn default_lang() -> String {
    "mini".to_string()
}

/// Input spec for a document cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellData {
    #[serde(default)]
    pub id: Option<String>,
    pub source: String,
    #[serde(default)]
    pub lang: Option<String>,
}

impl CellData {
    pub fn new(id: &str, source: &str) -> Self {
        CellData { id: Some(id.to_string()), source: source.to_string(), lang: None }
    }
}

/// Input spec for a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentData {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default = "default_autorun")]
    pub autorun: bool,
    #[serde(default)]
    pub cells: Vec<CellData>,
}

/// Input spec for a sheet. `cells` is a dense row-major grid of source text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetData {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default = "default_autorun")]
    pub autorun: bool,
    #[serde(default)]
    pub columns: Vec<ColumnMeta>,
    #[serde(default)]
    pub cells: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnMeta {
    #[serde(default)]
    pub name: Option<String>,
}

/// A document's layout: an ordered sequence of cell ids.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub name: Option<String>,
    pub lang: String,
    pub autorun: bool,
    pub cells: Vec<String>,
}

/// A sheet's layout: a dense grid of cell ids plus column metadata.
///
/// Cell ids are stable across structural edits; only their grid position
/// changes when rows or columns are spliced.
#[derive(Debug, Clone)]
pub struct Sheet {
    pub id: String,
    pub name: Option<String>,
    pub lang: String,
    pub autorun: bool,
    pub columns: Vec<ColumnMeta>,
    pub cells: Vec<Vec<String>>,
}

impl Sheet {
    pub fn n_rows(&self) -> usize {
        self.cells.len()
    }

    pub fn n_cols(&self) -> usize {
        self.cells.first().map_or(0, |r| r.len())
    }

    /// Local id of the cell at a grid position, if inside the grid.
    pub fn cell_at(&self, row: usize, col: usize) -> Option<&str> {
        self.cells.get(row).and_then(|r| r.get(col)).map(|s| s.as_str())
    }

    /// Column display names, defaulting to spreadsheet letters.
    pub fn col_names(&self) -> Vec<String> {
        (0..self.n_cols())
            .map(|i| {
                self.columns
                    .get(i)
                    .and_then(|c| c.name.clone())
                    .unwrap_or_else(|| crate::symbol::col_letters(i))
            })
            .collect()
    }

    /// Splices new rows of cell ids into the grid.
    pub fn insert_rows(&mut self, pos: usize, rows: Vec<Vec<String>>) {
        for (i, row) in rows.into_iter().enumerate() {
            self.cells.insert(pos + i, row);
        }
    }

    /// Removes `count` rows at `pos`, returning the displaced cell ids.
    pub fn delete_rows(&mut self, pos: usize, count: usize) -> Vec<String> {
        self.cells
            .drain(pos..pos + count)
            .flatten()
            .collect()
    }

    /// Splices new columns of cell ids into the grid. `cols[i][r]` is the id
    /// for row `r` of the i-th inserted column.
    pub fn insert_cols(&mut self, pos: usize, cols: Vec<Vec<String>>) {
        for (r, row) in self.cells.iter_mut().enumerate() {
            for (i, col) in cols.iter().enumerate() {
                row.insert(pos + i, col[r].clone());
            }
        }
        let n = cols.len();
        for _ in 0..n {
            if pos <= self.columns.len() {
                self.columns.insert(pos, ColumnMeta::default());
            }
        }
    }

    /// Removes `count` columns at `pos`, returning the displaced cell ids.
    pub fn delete_cols(&mut self, pos: usize, count: usize) -> Vec<String> {
        let mut removed = Vec::new();
        for row in &mut self.cells {
            removed.extend(row.drain(pos..pos + count));
        }
        if pos < self.columns.len() {
            let end = (pos + count).min(self.columns.len());
            self.columns.drain(pos..end);
        }
        removed
    }
}

/// Either kind of resource.
#[derive(Debug, Clone)]
pub enum Resource {
    Document(Document),
    Sheet(Sheet),
}

impl Resource {
    pub fn id(&self) -> &str {
        match self {
            Resource::Document(d) => &d.id,
            Resource::Sheet(s) => &s.id,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Resource::Document(d) => d.name.as_deref(),
            Resource::Sheet(s) => s.name.as_deref(),
        }
    }

    pub fn lang(&self) -> &str {
        match self {
            Resource::Document(d) => &d.lang,
            Resource::Sheet(s) => &s.lang,
        }
    }

    pub fn autorun(&self) -> bool {
        match self {
            Resource::Document(d) => d.autorun,
            Resource::Sheet(s) => s.autorun,
        }
    }

    pub fn set_autorun(&mut self, autorun: bool) {
        match self {
            Resource::Document(d) => d.autorun = autorun,
            Resource::Sheet(s) => s.autorun = autorun,
        }
    }

    pub fn set_name(&mut self, name: Option<String>) {
        match self {
            Resource::Document(d) => d.name = name,
            Resource::Sheet(s) => s.name = name,
        }
    }

    /// True if a symbol scope written as `ident` refers to this resource,
    /// by id or by display name.
    pub fn matches_scope(&self, ident: &str) -> bool {
        self.id() == ident || self.name() == Some(ident)
    }

    /// Local ids of all cells, in layout order.
    pub fn cell_ids(&self) -> Vec<String> {
        match self {
            Resource::Document(d) => d.cells.clone(),
            Resource::Sheet(s) => s.cells.iter().flatten().cloned().collect(),
        }
    }

    pub fn as_sheet(&self) -> Option<&Sheet> {
        match self {
            Resource::Sheet(s) => Some(s),
            Resource::Document(_) => None,
        }
    }

    pub fn as_sheet_mut(&mut self) -> Option<&mut Sheet> {
        match self {
            Resource::Sheet(s) => Some(s),
            Resource::Document(_) => None,
        }
    }

    pub fn as_document_mut(&mut self) -> Option<&mut Document> {
        match self {
            Resource::Document(d) => Some(d),
            Resource::Sheet(_) => None,
        }
    }
}
