use std::sync::Arc;

use serde_json::Value as JsonValue;

use skein_events::Event;

/// When a fan-out rule runs relative to grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOutMode {
    /// Children are grouped on their own, like any other event.
    BeforeGrouping,
    /// Children stay in their parent's slice.
    AfterGrouping,
}

type Expander = Arc<dyn Fn(&Event) -> Vec<(String, JsonValue)> + Send + Sync>;

/// Expands every event of one type into zero or more child events.
///
/// Children are inserted immediately after their source and carry ids derived
/// from it, so expanding the same ordered input twice yields identical output.
/// Children are never expanded again.
#[derive(Clone)]
pub struct FanOutRule {
    source_event_type: String,
    mode: FanOutMode,
    expand: Expander,
}

impl FanOutRule {
    /// `expand` returns `(event_type, data)` for each child.
    pub fn new<F>(source_event_type: impl Into<String>, mode: FanOutMode, expand: F) -> Self
    where
        F: Fn(&Event) -> Vec<(String, JsonValue)> + Send + Sync + 'static,
    {
        Self {
            source_event_type: source_event_type.into(),
            mode,
            expand: Arc::new(expand),
        }
    }

    pub fn before_grouping<F>(source_event_type: impl Into<String>, expand: F) -> Self
    where
        F: Fn(&Event) -> Vec<(String, JsonValue)> + Send + Sync + 'static,
    {
        Self::new(source_event_type, FanOutMode::BeforeGrouping, expand)
    }

    pub fn after_grouping<F>(source_event_type: impl Into<String>, expand: F) -> Self
    where
        F: Fn(&Event) -> Vec<(String, JsonValue)> + Send + Sync + 'static,
    {
        Self::new(source_event_type, FanOutMode::AfterGrouping, expand)
    }

    pub fn source_event_type(&self) -> &str {
        &self.source_event_type
    }

    pub fn mode(&self) -> FanOutMode {
        self.mode
    }

    /// Child ids are derived from the rule's position too, so two rules
    /// emitting the same child type for one source never collide.
    fn children(&self, source: &Event, position: usize) -> Vec<Event> {
        (self.expand)(source)
            .into_iter()
            .enumerate()
            .map(|(ordinal, (event_type, data))| source.child_of_rule(position, event_type, data, ordinal))
            .collect()
    }
}

impl std::fmt::Debug for FanOutRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOutRule")
            .field("source_event_type", &self.source_event_type)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FanOutRules {
    rules: Vec<FanOutRule>,
}

impl FanOutRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, rule: FanOutRule) {
        self.rules.push(rule);
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn source_event_types(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.source_event_type.as_str())
    }

    pub fn has_mode(&self, mode: FanOutMode) -> bool {
        self.rules.iter().any(|r| r.mode == mode)
    }

    /// Expand `events` with every rule of `mode`, keeping input order.
    pub fn apply(&self, mode: FanOutMode, events: Vec<Event>) -> Vec<Event> {
        if !self.has_mode(mode) {
            return events;
        }

        let mut expanded = Vec::with_capacity(events.len());
        for event in events {
            let children: Vec<Event> = self
                .rules
                .iter()
                .enumerate()
                .filter(|(_, r)| r.mode == mode && event.event_type == r.source_event_type)
                .flat_map(|(position, r)| r.children(&event, position))
                .collect();
            expanded.push(event);
            expanded.extend(children);
        }
        expanded
    }
}
