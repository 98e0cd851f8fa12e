//! The engine scheduler.
//!
//! Drives discrete cycles through four action phases: `analyse` (extract and
//! compile), `register` (install inputs/output into the graph), `evaluate`
//! (run the cell) and `update` (apply the result). Graph mutations happen
//! synchronously inside a cycle; context calls are dispatched at the end of a
//! cycle and their responses folded into the *next* cycle's actions, so
//! partial graph state is never interleaved with in-flight work.
//!
//! Every dispatched action carries the cell's generation token; an edit bumps
//! the token, and a completion whose token no longer matches is dropped.

use rustc_hash::FxHashMap;
use serde_json::{json, Value};

use crate::cell::{Cell, CellState};
use crate::context::{
    CompileRequest, CompositeContext, ExecuteRequest, LanguageContext,
};
use crate::error::{CellError, EngineError};
use crate::events::{
    EngineEvent, EventCollector, ResourceChangedEvent, SourceChangedEvent, StateChangedEvent,
};
use crate::graph::CellGraph;
use crate::resource::{CellData, Document, DocumentData, Resource, Sheet, SheetData};
use crate::symbol::{self, Symbol, SymbolKind};
use crate::transform::{self, Dim, EditKind, SpanChange, SymbolEdit};
use crate::value;

/// One pending action, keyed by cell id in the scheduler's action map;
/// inserting a newer action for the same cell supersedes the older one.
#[derive(Debug)]
enum Action {
    Analyse {
        token: u64,
    },
    Register {
        token: u64,
        inputs: Vec<Symbol>,
        output: Option<String>,
        value: Option<Value>,
        errors: Vec<CellError>,
        has_side_effects: bool,
    },
    Evaluate {
        token: u64,
    },
    Update {
        token: u64,
        value: Option<Value>,
        errors: Vec<CellError>,
    },
}

/// Counters for one scheduler cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub analysed: usize,
    pub registered: usize,
    pub evaluated: usize,
    pub updated: usize,
    pub cells_changed: usize,
    pub scheduled: usize,
}

impl CycleReport {
    /// Format as a concise one-line summary for logging.
    pub fn summary(&self) -> String {
        format!(
            "analysed={} registered={} evaluated={} updated={} changed={} scheduled={}",
            self.analysed,
            self.registered,
            self.evaluated,
            self.updated,
            self.cells_changed,
            self.scheduled
        )
    }

    fn is_empty(&self) -> bool {
        *self == CycleReport::default()
    }
}

/// Aggregate report from `run_once`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunReport {
    pub cycles: usize,
    pub totals: CycleReport,
}

impl RunReport {
    pub fn summary(&self) -> String {
        format!("{} cycles: {}", self.cycles, self.totals.summary())
    }
}

/// The reactive cell engine.
pub struct Engine {
    resources: FxHashMap<String, Resource>,
    graph: CellGraph,
    contexts: CompositeContext,
    globals: FxHashMap<String, Value>,
    next_actions: FxHashMap<String, Action>,
    events: EventCollector,
    cell_counter: u64,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Engine {
            resources: FxHashMap::default(),
            graph: CellGraph::new(),
            contexts: CompositeContext::new(),
            globals: FxHashMap::default(),
            next_actions: FxHashMap::default(),
            events: EventCollector::new(),
            cell_counter: 0,
        }
    }

    /// Registers a language context for `lang`.
    pub fn register_context(&mut self, lang: &str, context: Box<dyn LanguageContext>) {
        self.contexts.register(lang, context);
    }

    /// Injects a global value (e.g. a library function) resolvable by name
    /// from any unscoped variable reference.
    pub fn add_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_string(), value);
        self.graph.mark_unresolved_dirty();
    }

    pub fn cell(&self, id: &str) -> Option<&Cell> {
        self.graph.cell(id)
    }

    /// Qualified ids of all cells, sorted.
    pub fn cell_ids(&self) -> Vec<String> {
        self.graph.ids_sorted()
    }

    pub fn take_events(&mut self) -> Vec<EngineEvent> {
        self.events.take()
    }

    // =========================================================================
    // Resources
    // =========================================================================

    pub fn add_document(&mut self, data: DocumentData) -> Result<(), EngineError> {
        if self.resources.contains_key(&data.id) {
            return Err(EngineError::DuplicateResource(data.id));
        }
        let mut locals = Vec::with_capacity(data.cells.len());
        for cell_data in &data.cells {
            let local = match &cell_data.id {
                Some(id) => id.clone(),
                None => self.fresh_local_id(),
            };
            let lang = cell_data.lang.as_deref().unwrap_or(&data.lang);
            let mut cell = Cell::new(&data.id, &local, lang);
            cell.set_source(&cell_data.source, true);
            let id = cell.id.clone();
            self.graph.add_cell(cell);
            self.schedule_analyse(&id);
            locals.push(local);
        }
        self.resources.insert(
            data.id.clone(),
            Resource::Document(Document {
                id: data.id.clone(),
                name: data.name,
                lang: data.lang,
                autorun: data.autorun,
                cells: locals,
            }),
        );
        self.graph.mark_unresolved_dirty();
        self.events.push(EngineEvent::ResourceChanged(ResourceChangedEvent {
            resource: data.id,
            removed: false,
        }));
        Ok(())
    }

    pub fn add_sheet(&mut self, data: SheetData) -> Result<(), EngineError> {
        if self.resources.contains_key(&data.id) {
            return Err(EngineError::DuplicateResource(data.id));
        }
        let mut grid = Vec::with_capacity(data.cells.len());
        for (row, sources) in data.cells.iter().enumerate() {
            let mut id_row = Vec::with_capacity(sources.len());
            for (col, source) in sources.iter().enumerate() {
                let local =
                    self.create_sheet_cell(&data.id, &data.lang, source, row, col);
                id_row.push(local);
            }
            grid.push(id_row);
        }
        self.resources.insert(
            data.id.clone(),
            Resource::Sheet(Sheet {
                id: data.id.clone(),
                name: data.name,
                lang: data.lang,
                autorun: data.autorun,
                columns: data.columns,
                cells: grid,
            }),
        );
        self.graph.mark_unresolved_dirty();
        self.events.push(EngineEvent::ResourceChanged(ResourceChangedEvent {
            resource: data.id,
            removed: false,
        }));
        Ok(())
    }

    /// Removes a resource and all of its cells. Consumers in other resources
    /// are left to re-resolve, surfacing unresolved errors.
    pub fn remove_resource(&mut self, resource_id: &str) -> Result<(), EngineError> {
        let Some(resource) = self.resources.remove(resource_id) else {
            return Err(EngineError::UnknownResource(resource_id.to_string()));
        };
        for local in resource.cell_ids() {
            let qualified = symbol::qualified_id(resource_id, &local);
            self.graph.remove_cell(&qualified);
            self.next_actions.remove(&qualified);
        }
        self.events.push(EngineEvent::ResourceChanged(ResourceChangedEvent {
            resource: resource_id.to_string(),
            removed: true,
        }));
        Ok(())
    }

    pub fn set_autorun(&mut self, resource_id: &str, autorun: bool) -> Result<(), EngineError> {
        let locals = {
            let resource = self
                .resources
                .get_mut(resource_id)
                .ok_or_else(|| EngineError::UnknownResource(resource_id.to_string()))?;
            resource.set_autorun(autorun);
            resource.cell_ids()
        };
        // parked cells would otherwise wait for the next external trigger
        if autorun {
            for local in locals {
                let qualified = symbol::qualified_id(resource_id, &local);
                if let Some(cell) = self.graph.cell_mut(&qualified) {
                    if cell.state == CellState::Ready && cell.errors.is_empty() {
                        let token = cell.next_token();
                        self.next_actions.insert(qualified, Action::Evaluate { token });
                    }
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Cell edits
    // =========================================================================

    /// Replaces the source of a cell. For sheets the cell may be addressed by
    /// local id or by coordinate label (`A1`).
    pub fn update_cell(
        &mut self,
        resource_id: &str,
        cell_id: &str,
        source: &str,
    ) -> Result<(), EngineError> {
        let (qualified, is_sheet) = self.locate_cell(resource_id, cell_id)?;
        if !self.graph.contains(&qualified) {
            return Err(EngineError::UnknownCell(qualified));
        }
        // deregister while the old output name is still on the cell
        self.graph.reset_registration(&qualified);
        if let Some(cell) = self.graph.cell_mut(&qualified) {
            if is_sheet {
                set_sheet_source(cell, source);
            } else {
                cell.set_source(source, true);
            }
        }
        self.schedule_analyse(&qualified);
        Ok(())
    }

    /// Inserts a document cell at a position in the cell sequence.
    pub fn insert_cell_at(
        &mut self,
        doc_id: &str,
        pos: usize,
        data: CellData,
    ) -> Result<(), EngineError> {
        let lang = {
            let resource = self
                .resources
                .get(doc_id)
                .ok_or_else(|| EngineError::UnknownResource(doc_id.to_string()))?;
            if resource.as_sheet().is_some() {
                return Err(EngineError::WrongResourceKind {
                    id: doc_id.to_string(),
                    expected: "document",
                });
            }
            data.lang.clone().unwrap_or_else(|| resource.lang().to_string())
        };
        let local = match &data.id {
            Some(id) => id.clone(),
            None => self.fresh_local_id(),
        };
        {
            let doc = self
                .resources
                .get_mut(doc_id)
                .and_then(|r| r.as_document_mut())
                .ok_or_else(|| EngineError::UnknownResource(doc_id.to_string()))?;
            if pos > doc.cells.len() {
                return Err(EngineError::OutOfBounds { id: doc_id.to_string(), pos });
            }
            doc.cells.insert(pos, local.clone());
        }
        let mut cell = Cell::new(doc_id, &local, &lang);
        cell.set_source(&data.source, true);
        let id = cell.id.clone();
        self.graph.add_cell(cell);
        self.schedule_analyse(&id);
        Ok(())
    }

    pub fn append_cell(&mut self, doc_id: &str, data: CellData) -> Result<(), EngineError> {
        let pos = match self.resources.get(doc_id) {
            Some(Resource::Document(d)) => d.cells.len(),
            Some(Resource::Sheet(_)) => {
                return Err(EngineError::WrongResourceKind {
                    id: doc_id.to_string(),
                    expected: "document",
                })
            }
            None => return Err(EngineError::UnknownResource(doc_id.to_string())),
        };
        self.insert_cell_at(doc_id, pos, data)
    }

    pub fn remove_cell(&mut self, doc_id: &str, cell_id: &str) -> Result<(), EngineError> {
        let doc = self
            .resources
            .get_mut(doc_id)
            .and_then(|r| r.as_document_mut())
            .ok_or_else(|| EngineError::UnknownResource(doc_id.to_string()))?;
        let pos = doc
            .cells
            .iter()
            .position(|c| c == cell_id)
            .ok_or_else(|| EngineError::UnknownCell(cell_id.to_string()))?;
        doc.cells.remove(pos);
        let qualified = symbol::qualified_id(doc_id, cell_id);
        self.graph.remove_cell(&qualified);
        self.next_actions.remove(&qualified);
        Ok(())
    }

    // =========================================================================
    // Structural edits
    // =========================================================================

    pub fn insert_rows(
        &mut self,
        sheet_id: &str,
        pos: usize,
        data: Vec<Vec<String>>,
    ) -> Result<(), EngineError> {
        let (lang, n_rows) = self.sheet_meta(sheet_id)?;
        if pos > n_rows {
            return Err(EngineError::OutOfBounds { id: sheet_id.to_string(), pos });
        }
        let count = data.len();
        let edits = self.record_transformations(sheet_id, Dim::Row, pos, count as i64);

        let mut id_rows = Vec::with_capacity(count);
        for (i, sources) in data.iter().enumerate() {
            let mut id_row = Vec::with_capacity(sources.len());
            for (col, source) in sources.iter().enumerate() {
                id_row.push(self.create_sheet_cell(sheet_id, &lang, source, pos + i, col));
            }
            id_rows.push(id_row);
        }
        if let Some(sheet) = self.resources.get_mut(sheet_id).and_then(|r| r.as_sheet_mut()) {
            sheet.insert_rows(pos, id_rows);
        }

        self.apply_transformations(edits);
        self.refresh_positions(sheet_id);
        self.graph.mark_unresolved_dirty();
        Ok(())
    }

    pub fn delete_rows(
        &mut self,
        sheet_id: &str,
        pos: usize,
        count: usize,
    ) -> Result<(), EngineError> {
        let (_, n_rows) = self.sheet_meta(sheet_id)?;
        if pos + count > n_rows {
            return Err(EngineError::OutOfBounds { id: sheet_id.to_string(), pos });
        }
        let edits = self.record_transformations(sheet_id, Dim::Row, pos, -(count as i64));

        let removed = match self.resources.get_mut(sheet_id).and_then(|r| r.as_sheet_mut()) {
            Some(sheet) => sheet.delete_rows(pos, count),
            None => Vec::new(),
        };
        for local in removed {
            let qualified = symbol::qualified_id(sheet_id, &local);
            self.graph.remove_cell(&qualified);
            self.next_actions.remove(&qualified);
        }

        self.apply_transformations(edits);
        self.refresh_positions(sheet_id);
        Ok(())
    }

    pub fn insert_cols(
        &mut self,
        sheet_id: &str,
        pos: usize,
        data: Vec<Vec<String>>,
    ) -> Result<(), EngineError> {
        let (lang, n_rows) = self.sheet_meta(sheet_id)?;
        let n_cols = self
            .resources
            .get(sheet_id)
            .and_then(|r| r.as_sheet())
            .map_or(0, |s| s.n_cols());
        if pos > n_cols {
            return Err(EngineError::OutOfBounds { id: sheet_id.to_string(), pos });
        }
        // every inserted column must supply one cell per existing row
        if data.iter().any(|col| col.len() != n_rows) {
            return Err(EngineError::OutOfBounds { id: sheet_id.to_string(), pos });
        }
        let edits = self.record_transformations(sheet_id, Dim::Col, pos, data.len() as i64);

        let mut id_cols = Vec::with_capacity(data.len());
        for (i, sources) in data.iter().enumerate() {
            let mut id_col = Vec::with_capacity(sources.len());
            for (row, source) in sources.iter().enumerate() {
                id_col.push(self.create_sheet_cell(sheet_id, &lang, source, row, pos + i));
            }
            id_cols.push(id_col);
        }
        if let Some(sheet) = self.resources.get_mut(sheet_id).and_then(|r| r.as_sheet_mut()) {
            sheet.insert_cols(pos, id_cols);
        }

        self.apply_transformations(edits);
        self.refresh_positions(sheet_id);
        self.graph.mark_unresolved_dirty();
        Ok(())
    }

    pub fn delete_cols(
        &mut self,
        sheet_id: &str,
        pos: usize,
        count: usize,
    ) -> Result<(), EngineError> {
        let n_cols = match self.resources.get(sheet_id) {
            Some(Resource::Sheet(s)) => s.n_cols(),
            Some(Resource::Document(_)) => {
                return Err(EngineError::WrongResourceKind {
                    id: sheet_id.to_string(),
                    expected: "sheet",
                })
            }
            None => return Err(EngineError::UnknownResource(sheet_id.to_string())),
        };
        if pos + count > n_cols {
            return Err(EngineError::OutOfBounds { id: sheet_id.to_string(), pos });
        }
        let edits = self.record_transformations(sheet_id, Dim::Col, pos, -(count as i64));

        let removed = match self.resources.get_mut(sheet_id).and_then(|r| r.as_sheet_mut()) {
            Some(sheet) => sheet.delete_cols(pos, count),
            None => Vec::new(),
        };
        for local in removed {
            let qualified = symbol::qualified_id(sheet_id, &local);
            self.graph.remove_cell(&qualified);
            self.next_actions.remove(&qualified);
        }

        self.apply_transformations(edits);
        self.refresh_positions(sheet_id);
        Ok(())
    }

    /// Renames a resource's display name, rewriting every symbol whose scope
    /// was written as the old name.
    pub fn rename(&mut self, resource_id: &str, new_name: &str) -> Result<(), EngineError> {
        let old_name = match self.resources.get(resource_id) {
            Some(r) => r.name().map(String::from),
            None => return Err(EngineError::UnknownResource(resource_id.to_string())),
        };

        let mut edits: Vec<(String, Vec<SymbolEdit>)> = Vec::new();
        if let Some(old_name) = &old_name {
            for id in self.graph.ids_sorted() {
                let Some(cell) = self.graph.cell(&id) else { continue };
                let cell_edits: Vec<SymbolEdit> = cell
                    .source
                    .symbols
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.scope.as_deref() == Some(old_name))
                    .map(|(index, _)| SymbolEdit {
                        index,
                        kind: EditKind::Rescope(new_name.to_string()),
                    })
                    .collect();
                if !cell_edits.is_empty() {
                    edits.push((id, cell_edits));
                }
            }
        }

        if let Some(resource) = self.resources.get_mut(resource_id) {
            resource.set_name(Some(new_name.to_string()));
        }
        self.apply_transformations(edits);
        self.graph.mark_unresolved_dirty();
        Ok(())
    }

    // =========================================================================
    // Manual-run gating
    // =========================================================================

    /// Unlocks exactly one cell for its next evaluation.
    pub fn allow_running_cell(&mut self, id: &str) -> Result<(), EngineError> {
        self.unlock_cells(&[id.to_string()])
    }

    /// Unlocks a cell and every transitive input it reads from.
    pub fn allow_running_cell_and_predecessors(&mut self, id: &str) -> Result<(), EngineError> {
        if !self.graph.contains(id) {
            return Err(EngineError::UnknownCell(id.to_string()));
        }
        let mut ids: Vec<String> = self.graph.transitive_producers(id).into_iter().collect();
        ids.push(id.to_string());
        ids.sort();
        self.unlock_cells(&ids)
    }

    /// Unlocks every cell of a resource plus their external predecessors.
    pub fn allow_running_all_cells_of_document(
        &mut self,
        resource_id: &str,
    ) -> Result<(), EngineError> {
        let locals = match self.resources.get(resource_id) {
            Some(r) => r.cell_ids(),
            None => return Err(EngineError::UnknownResource(resource_id.to_string())),
        };
        let mut ids = Vec::new();
        for local in locals {
            let qualified = symbol::qualified_id(resource_id, &local);
            ids.extend(self.graph.transitive_producers(&qualified));
            ids.push(qualified);
        }
        ids.sort();
        ids.dedup();
        self.unlock_cells(&ids)
    }

    fn unlock_cells(&mut self, ids: &[String]) -> Result<(), EngineError> {
        for id in ids {
            let Some(cell) = self.graph.cell_mut(id) else {
                return Err(EngineError::UnknownCell(id.clone()));
            };
            cell.autorun_override = Some(true);
            // cells already runnable are scheduled immediately; the rest get
            // picked up by the scheduling pass as they become ready
            if cell.state == CellState::Ready && cell.errors.is_empty() {
                let token = cell.next_token();
                self.next_actions.insert(id.clone(), Action::Evaluate { token });
            }
        }
        Ok(())
    }

    // =========================================================================
    // Cycling
    // =========================================================================

    /// Executes one synchronous scheduler pass.
    pub fn cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        let current = std::mem::take(&mut self.next_actions);
        let mut analyses: Vec<(String, u64)> = Vec::new();
        let mut evaluations: Vec<(String, u64)> = Vec::new();

        // Integrate results and registrations first, in full, before the
        // graph recomputes.
        let mut sorted: Vec<(String, Action)> = current.into_iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        for (id, action) in sorted {
            match action {
                Action::Update { token, value, errors } => {
                    if self.apply_update(&id, token, value, errors) {
                        report.updated += 1;
                    }
                }
                Action::Register { token, inputs, output, value, errors, has_side_effects } => {
                    if self.apply_register(
                        &id,
                        token,
                        inputs,
                        output,
                        value,
                        errors,
                        has_side_effects,
                    ) {
                        report.registered += 1;
                    }
                }
                Action::Analyse { token } => analyses.push((id, token)),
                Action::Evaluate { token } => evaluations.push((id, token)),
            }
        }

        let changed = self.graph.update(&self.resources, &self.globals);
        report.cells_changed = changed.len();
        for id in &changed {
            if let Some(cell) = self.graph.cell(id) {
                self.events.push(EngineEvent::StateChanged(StateChangedEvent {
                    cell: id.clone(),
                    status: cell.display_status(),
                }));
            }
        }

        // Dispatch this cycle's analyse/evaluate actions; responses land in
        // the next cycle's action set.
        for (id, token) in analyses {
            if self.dispatch_analyse(&id, token) {
                report.analysed += 1;
            }
        }
        for (id, token) in evaluations {
            if self.dispatch_evaluate(&id, token) {
                report.evaluated += 1;
            }
        }

        // Scheduling pass: runnable cells get an evaluate action, cells
        // needing analysis get one if nothing is pending for them.
        for id in self.graph.ids_sorted() {
            if self.next_actions.contains_key(&id) {
                continue;
            }
            let (state, runnable) = match self.graph.cell(&id) {
                Some(cell) => {
                    let autorun = self
                        .resources
                        .get(&cell.doc_id)
                        .map_or(true, |r| r.autorun());
                    (cell.state, cell.errors.is_empty() && cell.may_run(autorun))
                }
                None => continue,
            };
            match state {
                CellState::Ready if runnable => {
                    if let Some(cell) = self.graph.cell_mut(&id) {
                        let token = cell.next_token();
                        self.next_actions.insert(id, Action::Evaluate { token });
                        report.scheduled += 1;
                    }
                }
                CellState::Unknown => {
                    self.schedule_analyse(&id);
                    report.scheduled += 1;
                }
                _ => {}
            }
        }

        report
    }

    /// Cycles until no pending actions remain and the graph reports no
    /// structural work. The iteration cap guards against a context that
    /// schedules work forever.
    pub fn run_once(&mut self) -> RunReport {
        let mut run = RunReport::default();
        while (!self.next_actions.is_empty() || self.graph.has_pending())
            && run.cycles < 10_000
        {
            let report = self.cycle();
            run.cycles += 1;
            run.totals.analysed += report.analysed;
            run.totals.registered += report.registered;
            run.totals.evaluated += report.evaluated;
            run.totals.updated += report.updated;
            run.totals.cells_changed += report.cells_changed;
            run.totals.scheduled += report.scheduled;
            if report.is_empty() && self.next_actions.is_empty() && !self.graph.has_pending() {
                break;
            }
        }
        run
    }

    /// Serializable snapshot of all resources and their cells.
    pub fn dump(&self) -> Value {
        let mut ids: Vec<&String> = self.resources.keys().collect();
        ids.sort();
        let resources: Vec<Value> = ids
            .iter()
            .map(|id| {
                let resource = &self.resources[*id];
                let cells: Value = match resource {
                    Resource::Document(d) => Value::Array(
                        d.cells
                            .iter()
                            .map(|local| self.dump_cell(&symbol::qualified_id(&d.id, local)))
                            .collect(),
                    ),
                    Resource::Sheet(s) => Value::Array(
                        s.cells
                            .iter()
                            .map(|row| {
                                Value::Array(
                                    row.iter()
                                        .map(|local| {
                                            self.dump_cell(&symbol::qualified_id(&s.id, local))
                                        })
                                        .collect(),
                                )
                            })
                            .collect(),
                    ),
                };
                json!({
                    "id": resource.id(),
                    "name": resource.name(),
                    "lang": resource.lang(),
                    "autorun": resource.autorun(),
                    "kind": match resource {
                        Resource::Document(_) => "document",
                        Resource::Sheet(_) => "sheet",
                    },
                    "cells": cells,
                })
            })
            .collect();
        json!({ "resources": resources })
    }

    fn dump_cell(&self, id: &str) -> Value {
        match self.graph.cell(id) {
            Some(cell) => json!({
                "id": cell.local_id,
                "lang": cell.lang,
                "source": cell.source.original,
                "status": cell.display_status(),
                "errors": cell.errors,
                "value": cell.value,
                "hasSideEffects": cell.has_side_effects,
            }),
            None => Value::Null,
        }
    }

    // =========================================================================
    // Action application
    // =========================================================================

    fn apply_update(
        &mut self,
        id: &str,
        token: u64,
        value: Option<Value>,
        errors: Vec<CellError>,
    ) -> bool {
        let Some(cell) = self.graph.cell_mut(id) else { return false };
        if cell.token != token {
            return false; // superseded by a newer edit
        }
        cell.clear_errors(|e| !e.kind.graph_owned());
        cell.errors.extend(errors);
        cell.value = value;
        // a failed run leaves the cell analysed; only clean runs reach Ok
        cell.state =
            if cell.errors.is_empty() { CellState::Ok } else { CellState::Analysed };
        let status = cell.display_status();
        self.graph.mark_value_changed(id);
        self.events.push(EngineEvent::StateChanged(StateChangedEvent {
            cell: id.to_string(),
            status,
        }));
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_register(
        &mut self,
        id: &str,
        token: u64,
        inputs: Vec<Symbol>,
        output: Option<String>,
        value: Option<Value>,
        errors: Vec<CellError>,
        has_side_effects: bool,
    ) -> bool {
        let Some(cell) = self.graph.cell_mut(id) else { return false };
        if cell.token != token {
            return false;
        }
        cell.clear_errors(|e| !e.kind.graph_owned());
        cell.errors.extend(errors);
        cell.has_side_effects = has_side_effects;
        let constant = value.is_some();
        if constant {
            cell.value = value;
            cell.state = CellState::Ok;
        } else {
            cell.state = CellState::Analysed;
        }
        let status = cell.display_status();
        self.graph.set_analysis(id, inputs, output);
        if constant {
            self.graph.mark_value_changed(id);
        }
        self.events.push(EngineEvent::StateChanged(StateChangedEvent {
            cell: id.to_string(),
            status,
        }));
        true
    }

    // =========================================================================
    // Action dispatch
    // =========================================================================

    fn dispatch_analyse(&mut self, id: &str, token: u64) -> bool {
        let (lang, code, original, is_constant, doc_id, is_sheet_cell) =
            match self.graph.cell(id) {
                Some(cell) if cell.token == token => (
                    cell.lang.clone(),
                    cell.source.transpiled.clone(),
                    cell.source.original.clone(),
                    cell.is_constant,
                    cell.doc_id.clone(),
                    cell.position.is_some(),
                ),
                _ => return false,
            };

        if is_constant {
            // constants never need a context round-trip
            self.next_actions.insert(
                id.to_string(),
                Action::Register {
                    token,
                    inputs: Vec::new(),
                    output: None,
                    value: Some(value::parse_literal(&original)),
                    errors: Vec::new(),
                    has_side_effects: false,
                },
            );
            return true;
        }

        let Some(context) = self.contexts.get_mut(&lang) else {
            self.next_actions.insert(
                id.to_string(),
                Action::Register {
                    token,
                    inputs: Vec::new(),
                    output: None,
                    value: None,
                    errors: vec![CellError::context(&lang)],
                    has_side_effects: false,
                },
            );
            return true;
        };

        let compiled = context.compile(CompileRequest {
            id,
            code: &code,
            lang: &lang,
            range_expressions_allowed: is_sheet_cell,
        });

        let errors: Vec<CellError> = compiled
            .messages
            .into_iter()
            .map(|m| CellError::syntax(m.message, m.position))
            .collect();
        let symbols = self
            .graph
            .cell(id)
            .map(|c| c.source.symbols.clone())
            .unwrap_or_default();
        let mut inputs: Vec<Symbol> = Vec::new();
        for name in compiled.inputs {
            if inputs.iter().any(|s| s.mapping_key() == name) {
                continue;
            }
            match symbols.iter().find(|s| s.mapping_key() == name) {
                Some(sym) => inputs.push(sym.clone()),
                // identifiers the extractor did not see resolve as plain
                // variables in the owning resource's scope
                None => inputs.push(Symbol {
                    kind: SymbolKind::Var,
                    name: name.clone(),
                    scope: None,
                    text: name.clone(),
                    mangled: name.clone(),
                    start: 0,
                    end: name.len(),
                    rect: None,
                    target: None,
                }),
            }
        }
        let output = compiled
            .outputs
            .first()
            .map(|name| symbol::qualified_id(&doc_id, name));

        self.next_actions.insert(
            id.to_string(),
            Action::Register {
                token,
                inputs,
                output,
                value: None,
                errors,
                has_side_effects: compiled.has_side_effects,
            },
        );
        true
    }

    fn dispatch_evaluate(&mut self, id: &str, token: u64) -> bool {
        let runnable = match self.graph.cell(id) {
            Some(cell) => {
                cell.token == token && cell.state == CellState::Ready && cell.errors.is_empty()
            }
            None => false,
        };
        if !runnable {
            return false;
        }

        let (lang, code) = match self.graph.cell_mut(id) {
            Some(cell) => {
                cell.state = CellState::Running;
                cell.autorun_override = None; // the unlock is one-shot
                (cell.lang.clone(), cell.source.transpiled.clone())
            }
            None => return false,
        };
        let inputs = match self.graph.cell(id) {
            Some(cell) => self.gather_inputs(cell),
            None => return false,
        };

        let Some(context) = self.contexts.get_mut(&lang) else {
            self.next_actions.insert(
                id.to_string(),
                Action::Update { token, value: None, errors: vec![CellError::context(&lang)] },
            );
            return true;
        };
        let result = context.execute(ExecuteRequest { id, code: &code, lang: &lang, inputs });
        let errors: Vec<CellError> = result
            .messages
            .into_iter()
            .map(|m| CellError::runtime(m.message))
            .collect();
        self.next_actions.insert(
            id.to_string(),
            Action::Update { token, value: result.value, errors },
        );
        true
    }

    /// Resolves every input symbol of a cell to a concrete value.
    fn gather_inputs(&self, cell: &Cell) -> Vec<(String, Value)> {
        let mut inputs = Vec::new();
        for sym in &cell.inputs {
            let resolution =
                self.graph
                    .resolve(sym, &cell.doc_id, &self.resources, &self.globals);
            let value = match sym.kind {
                SymbolKind::Var => match resolution.producers.first() {
                    Some(p) => self.graph.cell(p).and_then(|c| c.value.clone()),
                    None => self.globals.get(&sym.name).cloned(),
                },
                SymbolKind::Cell | SymbolKind::Range => {
                    self.gather_range(sym, resolution.target.as_deref())
                }
            };
            if let Some(v) = value {
                inputs.push((sym.mapping_key().to_string(), v));
            }
        }
        inputs
    }

    fn gather_range(&self, sym: &Symbol, target: Option<&str>) -> Option<Value> {
        let rect = sym.rect?;
        let sheet = target
            .and_then(|t| self.resources.get(t))
            .and_then(|r| r.as_sheet())?;
        let mut rows = Vec::new();
        for row in rect.start_row..=rect.end_row {
            let mut row_values = Vec::new();
            for col in rect.start_col..=rect.end_col {
                let v = sheet
                    .cell_at(row, col)
                    .map(|local| symbol::qualified_id(&sheet.id, local))
                    .and_then(|qid| self.graph.cell(&qid).and_then(|c| c.value.clone()))
                    .unwrap_or(Value::Null);
                row_values.push(v);
            }
            rows.push(row_values);
        }
        let names = sheet.col_names();
        let end = (rect.end_col + 1).min(names.len());
        let names = if rect.start_col < end {
            names[rect.start_col..end].to_vec()
        } else {
            Vec::new()
        };
        Some(value::range_value(rows, &names))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn schedule_analyse(&mut self, id: &str) {
        if let Some(cell) = self.graph.cell_mut(id) {
            let token = cell.next_token();
            self.next_actions.insert(id.to_string(), Action::Analyse { token });
        }
    }

    fn fresh_local_id(&mut self) -> String {
        self.cell_counter += 1;
        format!("c{}", self.cell_counter)
    }

    fn create_sheet_cell(
        &mut self,
        sheet_id: &str,
        lang: &str,
        source: &str,
        row: usize,
        col: usize,
    ) -> String {
        let local = self.fresh_local_id();
        let mut cell = Cell::new(sheet_id, &local, lang);
        cell.position = Some((row, col));
        set_sheet_source(&mut cell, source);
        let id = cell.id.clone();
        self.graph.add_cell(cell);
        self.schedule_analyse(&id);
        local
    }

    fn sheet_meta(&self, sheet_id: &str) -> Result<(String, usize), EngineError> {
        match self.resources.get(sheet_id) {
            Some(Resource::Sheet(s)) => Ok((s.lang.clone(), s.n_rows())),
            Some(Resource::Document(_)) => Err(EngineError::WrongResourceKind {
                id: sheet_id.to_string(),
                expected: "sheet",
            }),
            None => Err(EngineError::UnknownResource(sheet_id.to_string())),
        }
    }

    fn locate_cell(
        &self,
        resource_id: &str,
        cell_id: &str,
    ) -> Result<(String, bool), EngineError> {
        let resource = self
            .resources
            .get(resource_id)
            .ok_or_else(|| EngineError::UnknownResource(resource_id.to_string()))?;
        match resource {
            Resource::Document(d) => {
                if d.cells.iter().any(|c| c == cell_id) {
                    Ok((symbol::qualified_id(resource_id, cell_id), false))
                } else {
                    Err(EngineError::UnknownCell(cell_id.to_string()))
                }
            }
            Resource::Sheet(s) => {
                // coordinate labels are accepted as addresses
                if let Some((row, col)) = symbol::parse_cell_label(cell_id) {
                    if let Some(local) = s.cell_at(row, col) {
                        return Ok((symbol::qualified_id(resource_id, local), true));
                    }
                }
                if s.cells.iter().flatten().any(|c| c == cell_id) {
                    Ok((symbol::qualified_id(resource_id, cell_id), true))
                } else {
                    Err(EngineError::UnknownCell(cell_id.to_string()))
                }
            }
        }
    }

    /// Records every symbol rewrite a structural edit implies, across all
    /// cells of all resources, without mutating any source text yet.
    fn record_transformations(
        &self,
        sheet_id: &str,
        dim: Dim,
        pos: usize,
        count: i64,
    ) -> Vec<(String, Vec<SymbolEdit>)> {
        let Some(target) = self.resources.get(sheet_id) else {
            return Vec::new();
        };
        let mut all_edits = Vec::new();
        for id in self.graph.ids_sorted() {
            let Some(cell) = self.graph.cell(&id) else { continue };
            let mut cell_edits = Vec::new();
            for (index, sym) in cell.source.symbols.iter().enumerate() {
                if sym.kind == SymbolKind::Var {
                    continue;
                }
                let targets_sheet = match &sym.scope {
                    Some(scope) => target.matches_scope(scope),
                    None => cell.doc_id == sheet_id,
                };
                if !targets_sheet {
                    continue;
                }
                let Some(rect) = sym.rect else { continue };
                match transform::transform_rect(&rect, dim, pos, count) {
                    SpanChange::Unchanged => {}
                    SpanChange::Moved(new_rect) => cell_edits.push(SymbolEdit {
                        index,
                        kind: EditKind::Reposition(new_rect),
                    }),
                    SpanChange::Broken => {
                        cell_edits.push(SymbolEdit { index, kind: EditKind::Break })
                    }
                }
            }
            if !cell_edits.is_empty() {
                all_edits.push((id, cell_edits));
            }
        }
        all_edits
    }

    /// Applies recorded rewrites, resets affected cells for re-analysis, and
    /// emits one SourceChanged event per affected resource.
    fn apply_transformations(&mut self, edits: Vec<(String, Vec<SymbolEdit>)>) {
        let mut by_resource: FxHashMap<String, Vec<String>> = FxHashMap::default();
        for (id, cell_edits) in edits {
            let doc_id = match self.graph.cell_mut(&id) {
                Some(cell) => {
                    if !transform::apply_edits(&mut cell.source, cell_edits) {
                        continue;
                    }
                    cell.doc_id.clone()
                }
                None => continue,
            };
            // deregister while the old output name is still on the cell
            self.graph.reset_registration(&id);
            if let Some(cell) = self.graph.cell_mut(&id) {
                cell.reset();
            }
            self.schedule_analyse(&id);
            by_resource.entry(doc_id).or_default().push(id);
        }
        let mut resources: Vec<(String, Vec<String>)> = by_resource.into_iter().collect();
        resources.sort_by(|a, b| a.0.cmp(&b.0));
        for (resource, mut cells) in resources {
            cells.sort();
            self.events.push(EngineEvent::SourceChanged(SourceChangedEvent {
                resource,
                cells,
            }));
        }
    }

    /// Re-derives every sheet cell's stored grid position after a splice.
    fn refresh_positions(&mut self, sheet_id: &str) {
        let grid: Vec<Vec<String>> = match self.resources.get(sheet_id) {
            Some(Resource::Sheet(s)) => s.cells.clone(),
            _ => return,
        };
        for (row, locals) in grid.iter().enumerate() {
            for (col, local) in locals.iter().enumerate() {
                let qualified = symbol::qualified_id(sheet_id, local);
                if let Some(cell) = self.graph.cell_mut(&qualified) {
                    cell.position = Some((row, col));
                }
            }
        }
    }
}

/// Installs sheet-cell source: constants are parsed, not transpiled; a bare
/// `=` prefix is blanked in the transpiled text so downstream parsers see a
/// plain expression.
fn set_sheet_source(cell: &mut Cell, text: &str) {
    match symbol::expression_cell(text) {
        Some((output_name, prefix_len)) => {
            cell.set_source(text, true);
            if output_name.is_none() {
                let eq = prefix_len - 1;
                cell.source.transpiled.replace_range(eq..eq + 1, " ");
            }
        }
        None => cell.set_source(text, false),
    }
}
