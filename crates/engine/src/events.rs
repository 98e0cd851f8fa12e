//! Event types for engine change notifications.
//!
//! Events let a UI or session layer react to recomputation without polling.
//! The test harness also uses them to verify that structural edits report
//! exactly the cells whose source text was rewritten.

/// Events emitted by the engine during cycles and structural edits.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A cell's state, level, or error set changed during a graph update.
    StateChanged(StateChangedEvent),

    /// A structural edit rewrote source text in place.
    SourceChanged(SourceChangedEvent),

    /// A resource was added to or removed from the engine.
    ResourceChanged(ResourceChangedEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateChangedEvent {
    /// Qualified cell id.
    pub cell: String,
    /// External status string after the change (`ok`, `broken`, ...).
    pub status: &'static str,
}

/// Emitted once per structural edit, per affected resource.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceChangedEvent {
    /// The resource whose cells were rewritten.
    pub resource: String,
    /// Qualified ids of cells whose source text changed.
    pub cells: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceChangedEvent {
    pub resource: String,
    pub removed: bool,
}

/// Simple event collector; the engine owns one and hands batches out
/// through `Engine::take_events`.
#[derive(Debug, Default)]
pub struct EventCollector {
    events: Vec<EngineEvent>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn push(&mut self, event: EngineEvent) {
        self.events.push(event);
    }

    pub fn take(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Filter to only SourceChanged events.
    pub fn source_changed(&self) -> Vec<&SourceChangedEvent> {
        self.events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::SourceChanged(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    /// Filter to only StateChanged events.
    pub fn state_changed(&self) -> Vec<&StateChangedEvent> {
        self.events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::StateChanged(s) => Some(s),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_filtering_and_take() {
        let mut collector = EventCollector::new();
        collector.push(EngineEvent::StateChanged(StateChangedEvent {
            cell: "doc1!cell1".to_string(),
            status: "ok",
        }));
        collector.push(EngineEvent::SourceChanged(SourceChangedEvent {
            resource: "sheet1".to_string(),
            cells: vec!["sheet1!c3".to_string()],
        }));

        assert_eq!(collector.len(), 2);
        assert_eq!(collector.state_changed().len(), 1);
        assert_eq!(collector.source_changed().len(), 1);

        let taken = collector.take();
        assert_eq!(taken.len(), 2);
        assert!(collector.is_empty());
    }
}
