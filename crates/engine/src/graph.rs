//! The dependency graph: global cell registry and derived adjacency.
//!
//! # Edge direction
//!
//! ```text
//! A → B  means  "B consumes A's output"  (A is a producer of B)
//! ```
//!
//! # Invariants
//!
//! 1. **Bidirectional consistency:** if A ∈ deps[B] then B ∈ ins[A], and
//!    vice versa.
//! 2. **No dangling entries:** empty sets are removed, not stored.
//! 3. **Single writer:** resources never touch the indices; all mutation goes
//!    through `set_analysis` / `replace_edges` / `remove_cell`.
//! 4. **Graph-owned errors** (`collision`, `cyclic`, `unresolved`) are cleared
//!    and re-derived by `update` for every cell in the dirty closure; nothing
//!    else attaches or removes them.

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

use crate::cell::{Cell, CellState};
use crate::error::{CellError, ErrorKind};
use crate::resource::Resource;
use crate::symbol::{Symbol, SymbolKind};

/// How one input symbol resolved against the current resources.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Qualified ids of the producing cells (all grid slots for a range).
    pub producers: Vec<String>,
    /// False when no producer, grid slot, or global exists for the symbol.
    pub resolved: bool,
    /// Id of the resource the symbol's scope resolved to.
    pub target: Option<String>,
}

/// Resolves a symbol from a cell of `doc_id` to its producers.
pub fn resolve_symbol(
    sym: &Symbol,
    doc_id: &str,
    resources: &FxHashMap<String, Resource>,
    outs: &FxHashMap<String, FxHashSet<String>>,
    globals: &FxHashMap<String, Value>,
) -> Resolution {
    let target = match &sym.scope {
        Some(scope) => resources.values().find(|r| r.matches_scope(scope)),
        None => resources.get(doc_id),
    };
    let Some(target) = target else {
        return Resolution::default();
    };

    match sym.kind {
        SymbolKind::Var => {
            let qualified = crate::symbol::qualified_id(target.id(), &sym.name);
            if let Some(producers) = outs.get(&qualified) {
                let mut producers: Vec<String> = producers.iter().cloned().collect();
                producers.sort();
                return Resolution {
                    producers,
                    resolved: true,
                    target: Some(target.id().to_string()),
                };
            }
            // unscoped names fall back to the globals table
            if sym.scope.is_none() && globals.contains_key(&sym.name) {
                return Resolution {
                    producers: Vec::new(),
                    resolved: true,
                    target: None,
                };
            }
            Resolution::default()
        }
        SymbolKind::Cell | SymbolKind::Range => {
            let Some(sheet) = target.as_sheet() else {
                return Resolution::default();
            };
            let Some(rect) = sym.rect else {
                return Resolution::default();
            };
            let mut producers = Vec::new();
            let mut resolved = true;
            for row in rect.start_row..=rect.end_row {
                for col in rect.start_col..=rect.end_col {
                    match sheet.cell_at(row, col) {
                        Some(local) => {
                            producers.push(crate::symbol::qualified_id(&sheet.id, local))
                        }
                        None => resolved = false,
                    }
                }
            }
            Resolution { producers, resolved, target: Some(sheet.id.clone()) }
        }
    }
}

/// The global cell registry plus derived adjacency views.
#[derive(Default)]
pub struct CellGraph {
    /// Arena of all cells across all resources, keyed by qualified id.
    cells: FxHashMap<String, Cell>,

    /// Producers: qualified output name -> ids of cells declaring it.
    /// More than one producer for the same name is a collision.
    outs: FxHashMap<String, FxHashSet<String>>,

    /// Consumer -> producers it reads from.
    deps: FxHashMap<String, FxHashSet<String>>,

    /// Producer -> consumers reading from it.
    ins: FxHashMap<String, FxHashSet<String>>,

    /// Cells whose inputs/output registration changed since the last update.
    structure_changed: FxHashSet<String>,

    /// Cells whose value changed since the last update.
    value_changed: FxHashSet<String>,
}

impl CellGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.cells.contains_key(id)
    }

    pub fn cell(&self, id: &str) -> Option<&Cell> {
        self.cells.get(id)
    }

    pub fn cell_mut(&mut self, id: &str) -> Option<&mut Cell> {
        self.cells.get_mut(id)
    }

    /// All cell ids in sorted order, for deterministic iteration.
    pub fn ids_sorted(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cells.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells.values()
    }

    /// Producers the given cell currently reads from.
    pub fn producers_of(&self, id: &str) -> impl Iterator<Item = &str> {
        self.deps.get(id).into_iter().flat_map(|s| s.iter().map(|x| x.as_str()))
    }

    /// Consumers currently reading from the given cell.
    pub fn consumers_of(&self, id: &str) -> impl Iterator<Item = &str> {
        self.ins.get(id).into_iter().flat_map(|s| s.iter().map(|x| x.as_str()))
    }

    /// All transitive producers of a cell, the cell itself excluded.
    pub fn transitive_producers(&self, id: &str) -> FxHashSet<String> {
        let mut seen = FxHashSet::default();
        let mut stack: Vec<String> = self.producers_of(id).map(String::from).collect();
        while let Some(p) = stack.pop() {
            if seen.insert(p.clone()) {
                stack.extend(self.producers_of(&p).map(String::from));
            }
        }
        seen
    }

    /// Adds a fresh cell to the arena.
    pub fn add_cell(&mut self, cell: Cell) {
        self.structure_changed.insert(cell.id.clone());
        self.cells.insert(cell.id.clone(), cell);
    }

    /// Removes a cell, detaching it from every index. Consumers are marked
    /// structure-changed so their now-dangling inputs get re-derived as
    /// unresolved on the next update.
    pub fn remove_cell(&mut self, id: &str) -> Option<Cell> {
        let cell = self.cells.remove(id)?;
        self.unregister_output(id, cell.output.as_deref());
        self.replace_edges(id, FxHashSet::default());
        if let Some(consumers) = self.ins.remove(id) {
            for consumer in consumers {
                if let Some(preds) = self.deps.get_mut(&consumer) {
                    preds.remove(id);
                    if preds.is_empty() {
                        self.deps.remove(&consumer);
                    }
                }
                self.structure_changed.insert(consumer);
            }
        }
        self.structure_changed.remove(id);
        self.value_changed.remove(id);
        Some(cell)
    }

    /// Installs a completed analysis: resolved-to-be inputs and declared
    /// output. Edges are derived on the next `update`.
    pub fn set_analysis(&mut self, id: &str, inputs: Vec<Symbol>, output: Option<String>) {
        let old_output = match self.cells.get(id) {
            Some(cell) => cell.output.clone(),
            None => return,
        };
        if old_output != output {
            self.unregister_output(id, old_output.as_deref());
            if let Some(name) = &output {
                // siblings producing the same name must re-derive their
                // collision flags
                let entry = self.outs.entry(name.clone()).or_default();
                let siblings: Vec<String> = entry.iter().cloned().collect();
                let is_new_name = entry.is_empty();
                entry.insert(id.to_string());
                for sibling in siblings {
                    self.structure_changed.insert(sibling);
                }
                // a name appearing for the first time may satisfy inputs
                // that were previously unresolved
                if is_new_name {
                    self.mark_unresolved_dirty();
                }
            }
        }
        if let Some(cell) = self.cells.get_mut(id) {
            cell.inputs = inputs;
            cell.output = output;
        }
        self.structure_changed.insert(id.to_string());
    }

    /// Drops a cell's output registration and edges ahead of re-analysis.
    pub fn reset_registration(&mut self, id: &str) {
        let output = self.cells.get(id).and_then(|c| c.output.clone());
        self.unregister_output(id, output.as_deref());
        self.replace_edges(id, FxHashSet::default());
        if let Some(cell) = self.cells.get_mut(id) {
            cell.output = None;
            cell.inputs.clear();
        }
        self.structure_changed.insert(id.to_string());
    }

    fn unregister_output(&mut self, id: &str, output: Option<&str>) {
        let Some(name) = output else { return };
        let siblings: Vec<String> = match self.outs.get_mut(name) {
            Some(entry) => {
                entry.remove(id);
                let siblings = entry.iter().cloned().collect();
                if entry.is_empty() {
                    self.outs.remove(name);
                }
                siblings
            }
            None => return,
        };
        for sibling in siblings {
            self.structure_changed.insert(sibling);
        }
    }

    /// Marks every cell carrying an unresolved error for re-resolution.
    ///
    /// Called when something appears that could satisfy a previously dangling
    /// input: a freshly registered output name or a newly added resource.
    pub fn mark_unresolved_dirty(&mut self) {
        let stale: Vec<String> = self
            .cells
            .values()
            .filter(|c| c.has_error(ErrorKind::Unresolved))
            .map(|c| c.id.clone())
            .collect();
        for id in stale {
            self.structure_changed.insert(id);
        }
    }

    /// Resolves a symbol against the current output registry.
    pub fn resolve(
        &self,
        sym: &Symbol,
        doc_id: &str,
        resources: &FxHashMap<String, Resource>,
        globals: &FxHashMap<String, Value>,
    ) -> Resolution {
        resolve_symbol(sym, doc_id, resources, &self.outs, globals)
    }

    pub fn mark_value_changed(&mut self, id: &str) {
        self.value_changed.insert(id.to_string());
    }

    pub fn mark_structure_changed(&mut self, id: &str) {
        self.structure_changed.insert(id.to_string());
    }

    /// True when the next `update` has structural or value work to do.
    pub fn has_pending(&self) -> bool {
        !self.structure_changed.is_empty() || !self.value_changed.is_empty()
    }

    /// Replace all producer edges for a consumer atomically.
    fn replace_edges(&mut self, consumer: &str, new_producers: FxHashSet<String>) {
        if let Some(old) = self.deps.remove(consumer) {
            for producer in old {
                if let Some(set) = self.ins.get_mut(&producer) {
                    set.remove(consumer);
                    if set.is_empty() {
                        self.ins.remove(&producer);
                    }
                }
            }
        }
        if new_producers.is_empty() {
            return;
        }
        for producer in &new_producers {
            self.ins
                .entry(producer.clone())
                .or_default()
                .insert(consumer.to_string());
        }
        self.deps.insert(consumer.to_string(), new_producers);
    }

    /// Recomputes the dirty region: re-resolves structure-changed cells,
    /// re-derives graph-owned errors, assigns levels, and derives states.
    ///
    /// Returns the ids of every cell whose state, level, or error set
    /// changed, sorted for deterministic event emission.
    pub fn update(
        &mut self,
        resources: &FxHashMap<String, Resource>,
        globals: &FxHashMap<String, Value>,
    ) -> Vec<String> {
        if !self.has_pending() {
            return Vec::new();
        }

        // Dirty closure: seeds plus everything downstream through consumer
        // edges as they exist right now (pre-re-resolution), so former
        // dependents of edited cells are revisited too.
        let mut dirty: FxHashSet<String> = FxHashSet::default();
        let mut frontier: Vec<String> = self
            .structure_changed
            .iter()
            .chain(self.value_changed.iter())
            .cloned()
            .collect();
        while let Some(id) = frontier.pop() {
            if dirty.insert(id.clone()) {
                frontier.extend(self.consumers_of(&id).map(String::from));
            }
        }
        dirty.retain(|id| self.cells.contains_key(id));

        let mut snapshot: FxHashMap<String, (CellState, usize, Vec<CellError>)> = dirty
            .iter()
            .filter_map(|id| {
                self.cells
                    .get(id)
                    .map(|c| (id.clone(), (c.state, c.level, c.errors.clone())))
            })
            .collect();

        for id in &dirty {
            if let Some(cell) = self.cells.get_mut(id) {
                cell.clear_graph_errors();
            }
        }

        // Re-resolve inputs for structure-changed cells and rewire edges.
        let to_resolve: Vec<String> = self
            .structure_changed
            .iter()
            .filter(|id| self.cells.contains_key(*id))
            .cloned()
            .collect();
        for id in &to_resolve {
            let (doc_id, inputs) = {
                let cell = &self.cells[id];
                (cell.doc_id.clone(), cell.inputs.clone())
            };
            let mut producers: FxHashSet<String> = FxHashSet::default();
            let mut unresolved: Vec<String> = Vec::new();
            let mut targets: Vec<Option<String>> = Vec::with_capacity(inputs.len());
            for sym in &inputs {
                let res = resolve_symbol(sym, &doc_id, resources, &self.outs, globals);
                if !res.resolved {
                    unresolved.push(sym.text.clone());
                }
                producers.extend(res.producers);
                targets.push(res.target);
            }
            // self-edges stay: they surface as self-loop cycles
            self.replace_edges(id, producers);
            if let Some(cell) = self.cells.get_mut(id) {
                for (sym, target) in cell.inputs.iter_mut().zip(targets) {
                    sym.target = target;
                }
                for name in unresolved {
                    cell.errors.push(CellError::unresolved(&name));
                }
            }
        }

        // Collision pass: every output name with more than one producer.
        let colliding: Vec<(String, Vec<String>)> = self
            .outs
            .iter()
            .filter(|(_, producers)| producers.len() > 1)
            .map(|(name, producers)| {
                let mut ids: Vec<String> = producers.iter().cloned().collect();
                ids.sort();
                (name.clone(), ids)
            })
            .collect();
        let mut flagged: FxHashSet<String> = FxHashSet::default();
        for (name, ids) in &colliding {
            for id in ids {
                flagged.insert(id.clone());
                if let Some(cell) = self.cells.get(id) {
                    snapshot
                        .entry(id.clone())
                        .or_insert_with(|| (cell.state, cell.level, cell.errors.clone()));
                }
                if let Some(cell) = self.cells.get_mut(id) {
                    if !cell.has_error(ErrorKind::Collision) {
                        cell.errors.push(CellError::collision(name));
                    }
                }
            }
        }

        // Cycle pass over the whole graph.
        let cyclic = self.find_cycle_members();
        for id in &cyclic {
            flagged.insert(id.clone());
            if let Some(cell) = self.cells.get(id) {
                snapshot
                    .entry(id.clone())
                    .or_insert_with(|| (cell.state, cell.level, cell.errors.clone()));
            }
            if let Some(cell) = self.cells.get_mut(id) {
                if !cell.has_error(ErrorKind::Cyclic) {
                    cell.errors.push(CellError::cyclic());
                }
            }
        }

        // Cells that picked up a graph error lose their value so consumers
        // wait instead of reading stale data.
        let errored: Vec<String> = dirty
            .iter()
            .chain(flagged.iter())
            .filter(|id| {
                self.cells
                    .get(*id)
                    .map_or(false, |c| !c.errors.is_empty() && c.value.is_some())
            })
            .cloned()
            .collect();
        for id in errored {
            if let Some(cell) = self.cells.get_mut(&id) {
                cell.value = None;
                if cell.state > CellState::Analysed {
                    cell.state = CellState::Analysed;
                }
            }
        }

        self.assign_levels(&cyclic);

        // State derivation for the dirty region.
        let mut recheck: Vec<String> = dirty.iter().chain(flagged.iter()).cloned().collect();
        recheck.sort();
        recheck.dedup();
        // process upstream before downstream so demotions propagate within
        // one update
        recheck.sort_by_key(|id| self.cells.get(id).map_or(0, |c| c.level));
        for id in &recheck {
            self.derive_state(id, resources, globals);
        }

        self.structure_changed.clear();
        self.value_changed.clear();

        let mut changed: Vec<String> = recheck
            .into_iter()
            .filter(|id| match (snapshot.get(id), self.cells.get(id)) {
                (Some((state, level, errors)), Some(cell)) => {
                    cell.state != *state || cell.level != *level || cell.errors != *errors
                }
                (None, Some(_)) => true,
                _ => false,
            })
            .collect();
        changed.sort();
        changed
    }

    /// True when every input of the cell has a usable value.
    fn inputs_satisfied(
        &self,
        cell: &Cell,
        resources: &FxHashMap<String, Resource>,
        globals: &FxHashMap<String, Value>,
    ) -> bool {
        cell.inputs.iter().all(|sym| {
            let res = resolve_symbol(sym, &cell.doc_id, resources, &self.outs, globals);
            if !res.resolved {
                return false;
            }
            res.producers
                .iter()
                .all(|p| self.cells.get(p).map_or(false, |c| c.value.is_some()))
        })
    }

    fn derive_state(
        &mut self,
        id: &str,
        resources: &FxHashMap<String, Resource>,
        globals: &FxHashMap<String, Value>,
    ) {
        let Some(cell) = self.cells.get(id) else { return };
        // Unknown cells await analysis; Running cells await their result.
        if cell.state == CellState::Unknown || cell.state == CellState::Running {
            return;
        }

        let inputs_changed = self
            .deps
            .get(id)
            .map_or(false, |producers| {
                producers.iter().any(|p| self.value_changed.contains(p))
            });
        let satisfied = self.inputs_satisfied(cell, resources, globals);
        let was_structure_changed = self.structure_changed.contains(id);

        let Some(cell) = self.cells.get_mut(id) else { return };
        if inputs_changed {
            // a fresh upstream value invalidates the previous run
            cell.clear_errors(|e| e.kind == ErrorKind::Runtime);
        }
        if !cell.errors.is_empty() {
            return;
        }
        if inputs_changed {
            cell.state = if satisfied { CellState::Ready } else { CellState::Waiting };
            return;
        }
        if cell.state == CellState::Ok && !was_structure_changed {
            return;
        }
        cell.state = if satisfied { CellState::Ready } else { CellState::Waiting };
    }

    /// Assigns `level = 1 + max(level of producers)` via Kahn's algorithm,
    /// skipping cyclic cells. Iteration is sorted for determinism.
    fn assign_levels(&mut self, cyclic: &FxHashSet<String>) {
        let mut in_degree: FxHashMap<String, usize> = FxHashMap::default();
        for id in self.cells.keys() {
            if cyclic.contains(id) {
                continue;
            }
            let degree = self
                .deps
                .get(id)
                .map(|producers| {
                    producers
                        .iter()
                        .filter(|p| self.cells.contains_key(*p) && !cyclic.contains(*p))
                        .count()
                })
                .unwrap_or(0);
            in_degree.insert(id.clone(), degree);
        }

        let mut queue: Vec<String> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(id, _)| id.clone())
            .collect();
        queue.sort_by(|a, b| b.cmp(a)); // smallest popped first

        while let Some(id) = queue.pop() {
            let level = self
                .deps
                .get(&id)
                .map(|producers| {
                    producers
                        .iter()
                        .filter(|p| !cyclic.contains(*p))
                        .filter_map(|p| self.cells.get(p))
                        .map(|c| c.level + 1)
                        .max()
                        .unwrap_or(0)
                })
                .unwrap_or(0);
            if let Some(cell) = self.cells.get_mut(&id) {
                cell.level = level;
            }

            let mut released: Vec<String> = Vec::new();
            if let Some(consumers) = self.ins.get(&id) {
                for consumer in consumers {
                    if let Some(deg) = in_degree.get_mut(consumer) {
                        *deg = deg.saturating_sub(1);
                        if *deg == 0 {
                            released.push(consumer.clone());
                        }
                    }
                }
            }
            released.sort();
            for c in released.into_iter().rev() {
                queue.push(c);
            }
        }
    }

    /// Finds all cells on true cycles (SCC size > 1, or a self-loop), using
    /// iterative Tarjan to avoid stack overflow on deep graphs.
    fn find_cycle_members(&self) -> FxHashSet<String> {
        if self.deps.is_empty() {
            return FxHashSet::default();
        }

        let mut sorted_cells: Vec<&String> = self.deps.keys().collect();
        sorted_cells.sort();

        let sorted_neighbours = |id: &str| -> Vec<String> {
            let mut neighbours: Vec<String> = self
                .deps
                .get(id)
                .into_iter()
                .flat_map(|s| s.iter())
                .filter(|p| self.cells.contains_key(*p))
                .cloned()
                .collect();
            neighbours.sort();
            neighbours
        };

        let mut index_counter: u32 = 0;
        let mut stack: Vec<String> = Vec::new();
        let mut on_stack: FxHashSet<String> = FxHashSet::default();
        let mut indices: FxHashMap<String, u32> = FxHashMap::default();
        let mut lowlinks: FxHashMap<String, u32> = FxHashMap::default();
        let mut result: FxHashSet<String> = FxHashSet::default();

        struct DfsFrame {
            id: String,
            neighbours: Vec<String>,
            next_idx: usize,
        }

        for root in sorted_cells {
            if indices.contains_key(root) {
                continue;
            }

            let mut dfs_stack: Vec<DfsFrame> = Vec::new();

            indices.insert(root.clone(), index_counter);
            lowlinks.insert(root.clone(), index_counter);
            index_counter += 1;
            stack.push(root.clone());
            on_stack.insert(root.clone());
            dfs_stack.push(DfsFrame {
                id: root.clone(),
                neighbours: sorted_neighbours(root),
                next_idx: 0,
            });

            while let Some(frame) = dfs_stack.last_mut() {
                if frame.next_idx < frame.neighbours.len() {
                    let w = frame.neighbours[frame.next_idx].clone();
                    frame.next_idx += 1;

                    if !indices.contains_key(&w) {
                        indices.insert(w.clone(), index_counter);
                        lowlinks.insert(w.clone(), index_counter);
                        index_counter += 1;
                        stack.push(w.clone());
                        on_stack.insert(w.clone());
                        dfs_stack.push(DfsFrame {
                            id: w.clone(),
                            neighbours: sorted_neighbours(&w),
                            next_idx: 0,
                        });
                    } else if on_stack.contains(&w) {
                        let w_idx = indices[&w];
                        if let Some(v_low) = lowlinks.get_mut(&frame.id) {
                            if w_idx < *v_low {
                                *v_low = w_idx;
                            }
                        }
                    }
                } else {
                    let finished = match dfs_stack.pop() {
                        Some(f) => f,
                        None => break,
                    };
                    let v_low = lowlinks[&finished.id];
                    let v_idx = indices[&finished.id];

                    if let Some(parent) = dfs_stack.last() {
                        if let Some(parent_low) = lowlinks.get_mut(&parent.id) {
                            if v_low < *parent_low {
                                *parent_low = v_low;
                            }
                        }
                    }

                    if v_low == v_idx {
                        let mut scc = Vec::new();
                        while let Some(w) = stack.pop() {
                            on_stack.remove(&w);
                            let done = w == finished.id;
                            scc.push(w);
                            if done {
                                break;
                            }
                        }
                        if scc.len() > 1 {
                            result.extend(scc);
                        } else if let [only] = scc.as_slice() {
                            let self_loop = self
                                .deps
                                .get(only)
                                .map_or(false, |p| p.contains(only));
                            if self_loop {
                                result.insert(only.clone());
                            }
                        }
                    }
                }
            }
        }

        result
    }

    /// Check all adjacency invariants. Panics if any are violated.
    #[cfg(test)]
    pub fn assert_consistent(&self) {
        for (consumer, producers) in &self.deps {
            assert!(!producers.is_empty(), "empty deps set stored for {consumer}");
            for producer in producers {
                assert!(
                    self.ins.get(producer).map_or(false, |s| s.contains(consumer)),
                    "missing ins edge: {producer} should list {consumer}"
                );
            }
        }
        for (producer, consumers) in &self.ins {
            assert!(!consumers.is_empty(), "empty ins set stored for {producer}");
            for consumer in consumers {
                assert!(
                    self.deps.get(consumer).map_or(false, |s| s.contains(producer)),
                    "missing deps edge: {consumer} should list {producer}"
                );
            }
        }
        for (name, producers) in &self.outs {
            assert!(!producers.is_empty(), "empty outs set stored for {name}");
            for id in producers {
                assert!(
                    self.cells.get(id).map_or(false, |c| c.output.as_deref() == Some(name)),
                    "outs entry {name} -> {id} does not match the cell's output"
                );
            }
        }
    }
}
