use core::fmt::{Debug, Display};
use core::hash::Hash;
use std::collections::{BTreeMap, HashSet};

use serde_json::Value as JsonValue;

use skein_core::TenantId;
use skein_events::{Event, StreamActionType};

use super::fan_out::{FanOutMode, FanOutRules};

/// Anything usable as a slice key.
pub trait SliceIdentity: Clone + Eq + Ord + Hash + Debug + Display + Send + Sync + 'static {}

impl<T> SliceIdentity for T where T: Clone + Eq + Ord + Hash + Debug + Display + Send + Sync + 'static {}

/// Drop repeated event ids (first occurrence wins) and stable-sort by sequence.
///
/// Stability keeps fan-out children right behind the parent they share a
/// sequence with.
pub fn normalize_events(events: Vec<Event>) -> Vec<Event> {
    let mut seen = HashSet::with_capacity(events.len());
    let mut events: Vec<Event> = events.into_iter().filter(|e| seen.insert(e.id)).collect();
    events.sort_by_key(|e| e.sequence);
    events
}

/// The events of one identity within one tenant.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSlice<Id> {
    pub id: Id,
    pub tenant_id: TenantId,
    pub events: Vec<Event>,
    /// Related documents attached by enrichment hooks.
    pub references: BTreeMap<String, JsonValue>,
}

impl<Id: SliceIdentity> EventSlice<Id> {
    pub fn new(id: Id, tenant_id: TenantId) -> Self {
        Self {
            id,
            tenant_id,
            events: Vec::new(),
            references: BTreeMap::new(),
        }
    }

    /// `Start` when the slice begins with the first event of its stream.
    pub fn action_type(&self) -> StreamActionType {
        match self.events.first() {
            Some(first) if first.version == 1 => StreamActionType::Start,
            _ => StreamActionType::Append,
        }
    }

    pub fn normalize(&mut self) {
        self.events = normalize_events(std::mem::take(&mut self.events));
    }

    /// Normalize, then expand after-grouping fan-out rules in place.
    pub fn apply_fan_out(&mut self, rules: &FanOutRules) {
        self.normalize();
        if !rules.is_empty() {
            self.events = rules.apply(FanOutMode::AfterGrouping, std::mem::take(&mut self.events));
        }
    }

    pub fn remove_sequence(&mut self, sequence: u64) -> usize {
        let before = self.events.len();
        self.events.retain(|e| e.sequence != sequence);
        before - self.events.len()
    }

    pub fn add_reference(&mut self, name: impl Into<String>, document: JsonValue) {
        self.references.insert(name.into(), document);
    }

    pub fn reference(&self, name: &str) -> Option<&JsonValue> {
        self.references.get(name)
    }

    pub fn sequences(&self) -> impl Iterator<Item = u64> + '_ {
        self.events.iter().map(|e| e.sequence)
    }
}

/// Every slice produced from one range for one tenant, keyed by identity.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceGroup<Id> {
    pub tenant_id: TenantId,
    slices: BTreeMap<Id, EventSlice<Id>>,
}

impl<Id: SliceIdentity> SliceGroup<Id> {
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            slices: BTreeMap::new(),
        }
    }

    fn slice_mut(&mut self, id: Id) -> &mut EventSlice<Id> {
        let tenant_id = &self.tenant_id;
        self.slices
            .entry(id.clone())
            .or_insert_with(|| EventSlice::new(id, tenant_id.clone()))
    }

    pub fn add_event(&mut self, id: Id, event: Event) {
        self.slice_mut(id).events.push(event);
    }

    pub fn add_events<I>(&mut self, id: Id, events: I)
    where
        I: IntoIterator<Item = Event>,
    {
        self.slice_mut(id).events.extend(events);
    }

    /// Route one event to several identities.
    pub fn add_event_to_many<I>(&mut self, ids: I, event: &Event)
    where
        I: IntoIterator<Item = Id>,
    {
        for id in ids {
            self.add_event(id, event.clone());
        }
    }

    pub fn slice(&self, id: &Id) -> Option<&EventSlice<Id>> {
        self.slices.get(id)
    }

    pub fn slices(&self) -> impl Iterator<Item = &EventSlice<Id>> {
        self.slices.values()
    }

    pub fn slices_mut(&mut self) -> impl Iterator<Item = &mut EventSlice<Id>> {
        self.slices.values_mut()
    }

    pub fn ids(&self) -> impl Iterator<Item = &Id> {
        self.slices.keys()
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn event_count(&self) -> usize {
        self.slices.values().map(|s| s.events.len()).sum()
    }

    pub fn normalize(&mut self) {
        for slice in self.slices.values_mut() {
            slice.normalize();
        }
    }

    pub fn apply_fan_out(&mut self, rules: &FanOutRules) {
        for slice in self.slices.values_mut() {
            slice.apply_fan_out(rules);
        }
    }

    /// Remove `sequence` from every slice, dropping slices left empty.
    pub fn remove_sequence(&mut self, sequence: u64) -> usize {
        let removed = self
            .slices
            .values_mut()
            .map(|s| s.remove_sequence(sequence))
            .sum();
        self.slices.retain(|_, s| !s.events.is_empty());
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use skein_core::EventId;
    use skein_events::StreamIdentity;

    fn event(sequence: u64, version: u64) -> Event {
        Event {
            id: EventId::new(),
            sequence,
            version,
            stream: StreamIdentity::key("s1"),
            stream_type: None,
            tenant_id: TenantId::default_tenant(),
            timestamp: Utc::now(),
            event_type: "order.placed".into(),
            causation_id: None,
            correlation_id: None,
            data: json!({}),
        }
    }

    #[test]
    fn normalization_dedupes_and_orders_by_sequence() {
        let a = event(1, 1);
        let b = event(2, 2);
        let c = event(3, 3);
        let mut slice = EventSlice::new("s1".to_string(), TenantId::default_tenant());
        slice.events = vec![c.clone(), a.clone(), b.clone(), a.clone()];

        slice.normalize();
        assert_eq!(slice.sequences().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(slice.action_type(), StreamActionType::Start);
    }

    #[test]
    fn slices_not_starting_at_version_one_append() {
        let mut slice = EventSlice::new("s1".to_string(), TenantId::default_tenant());
        slice.events = vec![event(10, 4)];
        assert_eq!(slice.action_type(), StreamActionType::Append);
    }

    #[test]
    fn removing_a_sequence_drops_empty_slices() {
        let mut group = SliceGroup::new(TenantId::default_tenant());
        group.add_event("a".to_string(), event(1, 1));
        group.add_events("b".to_string(), [event(2, 1), event(3, 2)]);
        group.add_event_to_many(["a".to_string(), "b".to_string()], &event(4, 2));

        assert_eq!(group.event_count(), 5);
        assert_eq!(group.remove_sequence(1), 1);
        assert_eq!(group.remove_sequence(4), 2);
        assert_eq!(group.ids().cloned().collect::<Vec<_>>(), vec!["b".to_string()]);
        assert_eq!(group.remove_sequence(99), 0);
    }
}
