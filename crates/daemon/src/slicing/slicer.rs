use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use skein_core::TenantId;
use skein_events::{Event, TenantScoped};

use super::fan_out::{FanOutMode, FanOutRule, FanOutRules};
use super::grouping::Grouper;
use super::slice::{SliceGroup, SliceIdentity, normalize_events};
use crate::error::GroupingError;

/// Attaches related documents to slices once grouping is done.
#[async_trait]
pub trait SliceEnricher<Id: SliceIdentity>: Send + Sync {
    async fn enrich(&self, group: &mut SliceGroup<Id>) -> Result<(), GroupingError>;
}

/// How a page is split by tenant before grouping.
///
/// No slice ever spans tenants: a page holding events of several tenants is
/// split per tenant under either mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tenancy {
    /// One group under the page's tenant. An empty page still yields one
    /// empty group under the default tenant.
    #[default]
    Single,
    /// One group per tenant present in the page, none for an empty page.
    PerTenant,
}

struct GroupingRule<Id> {
    /// Empty means every event.
    event_types: Vec<String>,
    grouper: Arc<dyn Grouper<Id>>,
}

impl<Id> Clone for GroupingRule<Id> {
    fn clone(&self) -> Self {
        Self {
            event_types: self.event_types.clone(),
            grouper: self.grouper.clone(),
        }
    }
}

/// Composable partitioning of event pages into slice groups.
pub struct EventSlicer<Id> {
    rules: Vec<GroupingRule<Id>>,
    fan_outs: FanOutRules,
    tenancy: Tenancy,
    enrichers: Vec<Arc<dyn SliceEnricher<Id>>>,
}

impl<Id> Clone for EventSlicer<Id> {
    fn clone(&self) -> Self {
        Self {
            rules: self.rules.clone(),
            fan_outs: self.fan_outs.clone(),
            tenancy: self.tenancy,
            enrichers: self.enrichers.clone(),
        }
    }
}

impl<Id: SliceIdentity> Default for EventSlicer<Id> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id: SliceIdentity> EventSlicer<Id> {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            fan_outs: FanOutRules::new(),
            tenancy: Tenancy::Single,
            enrichers: Vec::new(),
        }
    }

    /// Group every event with `grouper`.
    pub fn group_by<G>(mut self, grouper: G) -> Self
    where
        G: Grouper<Id> + 'static,
    {
        self.rules.push(GroupingRule {
            event_types: Vec::new(),
            grouper: Arc::new(grouper),
        });
        self
    }

    /// Group only events of `event_types` with `grouper`.
    pub fn group_by_for<I, S, G>(mut self, event_types: I, grouper: G) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        G: Grouper<Id> + 'static,
    {
        self.rules.push(GroupingRule {
            event_types: event_types.into_iter().map(Into::into).collect(),
            grouper: Arc::new(grouper),
        });
        self
    }

    pub fn fan_out(mut self, rule: FanOutRule) -> Self {
        self.fan_outs.add(rule);
        self
    }

    pub fn per_tenant(mut self) -> Self {
        self.tenancy = Tenancy::PerTenant;
        self
    }

    pub fn enrich_with<E>(mut self, enricher: E) -> Self
    where
        E: SliceEnricher<Id> + 'static,
    {
        self.enrichers.push(Arc::new(enricher));
        self
    }

    pub fn tenancy(&self) -> Tenancy {
        self.tenancy
    }

    pub fn fan_outs(&self) -> &FanOutRules {
        &self.fan_outs
    }

    /// Partition `events` into one slice group per tenant.
    pub async fn slice(&self, events: &[Event]) -> Result<Vec<SliceGroup<Id>>, GroupingError> {
        let events = normalize_events(events.to_vec());

        let mut by_tenant: BTreeMap<TenantId, Vec<Event>> = BTreeMap::new();
        for event in events {
            by_tenant.entry(event.tenant_id().clone()).or_default().push(event);
        }
        if by_tenant.is_empty() && self.tenancy == Tenancy::Single {
            by_tenant.insert(TenantId::default_tenant(), Vec::new());
        }
        let splits: Vec<(TenantId, Vec<Event>)> = by_tenant.into_iter().collect();

        let mut groups = Vec::with_capacity(splits.len());
        for (tenant_id, events) in splits {
            let mut group = SliceGroup::new(tenant_id);
            self.slice_into(&events, &mut group).await?;
            groups.push(group);
        }
        Ok(groups)
    }

    /// Slice `events` into an existing group, ignoring tenancy.
    ///
    /// Lookups are awaited before any after-grouping fan-out runs, and every
    /// slice is de-duplicated and ordered first.
    pub async fn slice_into(&self, events: &[Event], group: &mut SliceGroup<Id>) -> Result<(), GroupingError> {
        let events = self
            .fan_outs
            .apply(FanOutMode::BeforeGrouping, normalize_events(events.to_vec()));

        for rule in &self.rules {
            if rule.event_types.is_empty() {
                rule.grouper.group(&events, group).await?;
            } else {
                let selected: Vec<Event> = events
                    .iter()
                    .filter(|e| rule.event_types.iter().any(|t| *t == e.event_type))
                    .cloned()
                    .collect();
                if !selected.is_empty() {
                    rule.grouper.group(&selected, group).await?;
                }
            }
        }

        group.apply_fan_out(&self.fan_outs);

        for enricher in &self.enrichers {
            enricher.enrich(group).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slicing::grouping::{ByIdentity, ByStream, ByTenant};
    use chrono::Utc;
    use proptest::prelude::*;
    use serde_json::json;
    use skein_core::EventId;
    use skein_events::{StreamActionType, StreamIdentity};
    use std::collections::HashMap;

    fn event(sequence: u64, version: u64, stream: &str, tenant: &str, event_type: &str) -> Event {
        Event {
            id: EventId::new(),
            sequence,
            version,
            stream: StreamIdentity::key(stream),
            stream_type: None,
            tenant_id: TenantId::from(tenant),
            timestamp: Utc::now(),
            event_type: event_type.into(),
            causation_id: None,
            correlation_id: None,
            data: json!({ "lines": 2 }),
        }
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        futures::executor::block_on(future)
    }

    #[tokio::test]
    async fn a_single_stream_page_becomes_one_starting_slice() {
        let mut events: Vec<Event> = (1..=100)
            .map(|n| event(n, n, "s1", "t1", "order.line_added"))
            .collect();
        events.reverse();

        let groups = EventSlicer::new().group_by(ByStream).slice(&events).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 1);

        let slice = groups[0].slice(&StreamIdentity::key("s1")).unwrap();
        assert_eq!(slice.events.len(), 100);
        assert!(slice.events.windows(2).all(|w| w[0].sequence < w[1].sequence));
        assert_eq!(slice.action_type(), StreamActionType::Start);
    }

    #[tokio::test]
    async fn tenant_rollup_yields_one_slice_per_tenant() {
        let events = vec![
            event(1, 1, "a", "t1", "x"),
            event(2, 1, "b", "t2", "x"),
            event(3, 2, "a", "t1", "x"),
            event(4, 1, "c", "t1", "x"),
            event(5, 2, "b", "t2", "x"),
        ];

        let groups = EventSlicer::new().group_by(ByTenant).slice(&events).await.unwrap();
        let counts: HashMap<String, usize> = groups
            .iter()
            .flat_map(|g| g.slices())
            .map(|s| (s.id.to_string(), s.events.len()))
            .collect();

        assert_eq!(counts.len(), 2);
        assert_eq!(counts["t1"], 3);
        assert_eq!(counts["t2"], 2);
    }

    #[tokio::test]
    async fn per_tenant_slicing_scopes_slices_to_their_tenant() {
        let events = vec![event(1, 1, "a", "t1", "x"), event(2, 1, "a", "t2", "x")];
        let groups = EventSlicer::new()
            .group_by(ByStream)
            .per_tenant()
            .slice(&events)
            .await
            .unwrap();

        assert_eq!(groups.len(), 2);
        for group in &groups {
            let slice = group.slice(&StreamIdentity::key("a")).unwrap();
            assert_eq!(slice.tenant_id, group.tenant_id);
            assert_eq!(slice.events.len(), 1);
        }
    }

    #[tokio::test]
    async fn mixed_tenant_pages_never_share_a_slice() {
        let events = vec![event(1, 1, "a", "t1", "x"), event(2, 1, "a", "t2", "x")];
        let groups = EventSlicer::new().group_by(ByStream).slice(&events).await.unwrap();

        assert_eq!(groups.len(), 2);
        let tenants: Vec<_> = groups.iter().map(|g| g.tenant_id.to_string()).collect();
        assert_eq!(tenants, vec!["t1", "t2"]);
        for group in &groups {
            let slice = group.slice(&StreamIdentity::key("a")).unwrap();
            assert_eq!(slice.tenant_id, group.tenant_id);
            assert_eq!(slice.events.len(), 1);
            assert_eq!(slice.events[0].tenant_id, group.tenant_id);
        }
    }

    #[tokio::test]
    async fn single_tenant_pages_are_labelled_with_their_tenant() {
        let events = vec![event(1, 1, "a", "t1", "x"), event(2, 2, "a", "t1", "x")];
        let groups = EventSlicer::new().group_by(ByStream).slice(&events).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].tenant_id, TenantId::from("t1"));

        let empty = EventSlicer::<StreamIdentity>::new().group_by(ByStream).slice(&[]).await.unwrap();
        assert_eq!(empty.len(), 1);
        assert_eq!(empty[0].tenant_id, TenantId::default_tenant());
        assert!(EventSlicer::<StreamIdentity>::new().per_tenant().slice(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn filtered_rules_only_see_their_event_types() {
        let events = vec![
            event(1, 1, "a", "t1", "order.placed"),
            event(2, 2, "a", "t1", "order.noise"),
        ];
        let slicer = EventSlicer::new().group_by_for(["order.placed"], ByIdentity::new(|e: &Event| Some(e.stream.to_string())));

        let groups = slicer.slice(&events).await.unwrap();
        assert_eq!(groups[0].event_count(), 1);
    }

    fn lines_rule(mode: FanOutMode) -> FanOutRule {
        FanOutRule::new("order.placed", mode, |e: &Event| {
            let lines = e.data["lines"].as_u64().unwrap_or(0);
            (0..lines).map(|n| (format!("line.{n}"), json!({ "n": n }))).collect()
        })
    }

    #[tokio::test]
    async fn before_grouping_children_are_grouped_independently() {
        let events = vec![event(1, 1, "a", "t1", "order.placed")];
        let slicer = EventSlicer::new()
            .group_by(ByIdentity::new(|e: &Event| Some(e.event_type.clone())))
            .fan_out(lines_rule(FanOutMode::BeforeGrouping));

        let groups = slicer.slice(&events).await.unwrap();
        assert_eq!(groups[0].len(), 3);
    }

    #[tokio::test]
    async fn after_grouping_children_stay_with_their_parent() {
        let events = vec![
            event(2, 2, "a", "t1", "order.shipped"),
            event(1, 1, "a", "t1", "order.placed"),
        ];
        let slicer = EventSlicer::new()
            .group_by(ByStream)
            .fan_out(lines_rule(FanOutMode::AfterGrouping));

        let groups = slicer.slice(&events).await.unwrap();
        let slice = groups[0].slice(&StreamIdentity::key("a")).unwrap();
        let types: Vec<_> = slice.events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["order.placed", "line.0", "line.1", "order.shipped"]);
    }

    #[tokio::test]
    async fn overlapping_before_grouping_rules_keep_all_children() {
        let events = vec![event(1, 1, "a", "t1", "order.placed")];
        let slicer = EventSlicer::new()
            .group_by(ByStream)
            .fan_out(FanOutRule::before_grouping("order.placed", |_: &Event| {
                vec![("order.line".to_string(), json!({ "from": "A" }))]
            }))
            .fan_out(FanOutRule::before_grouping("order.placed", |_: &Event| {
                vec![("order.line".to_string(), json!({ "from": "B" }))]
            }));

        let groups = slicer.slice(&events).await.unwrap();
        let slice = groups[0].slice(&StreamIdentity::key("a")).unwrap();
        let children: Vec<_> = slice.events[1..].iter().map(|e| e.data["from"].clone()).collect();
        assert_eq!(children, vec![json!("A"), json!("B")]);
    }

    struct CustomerNames;

    #[async_trait]
    impl SliceEnricher<StreamIdentity> for CustomerNames {
        async fn enrich(&self, group: &mut SliceGroup<StreamIdentity>) -> Result<(), GroupingError> {
            for slice in group.slices_mut() {
                let name = format!("customer of {}", slice.id);
                slice.add_reference("customer", json!({ "name": name }));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn enrichers_run_after_grouping() {
        let events = vec![event(1, 1, "a", "t1", "order.placed")];
        let slicer = EventSlicer::new().group_by(ByStream).enrich_with(CustomerNames);

        let groups = slicer.slice(&events).await.unwrap();
        let slice = groups[0].slice(&StreamIdentity::key("a")).unwrap();
        assert_eq!(slice.reference("customer"), Some(&json!({ "name": "customer of a" })));
    }

    fn arbitrary_events() -> impl Strategy<Value = Vec<Event>> {
        prop::collection::vec((0usize..4, 0usize..3, 0usize..2), 0..60).prop_map(|specs| {
            specs
                .into_iter()
                .enumerate()
                .map(|(i, (stream, tenant, kind))| {
                    let kind = if kind == 0 { "order.placed" } else { "order.shipped" };
                    event(i as u64 + 1, 1, &format!("s{stream}"), &format!("t{tenant}"), kind)
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn slicing_partitions_every_event_exactly_once(mut events in arbitrary_events(), seed in any::<u64>()) {
            let total = events.len();
            if total > 1 {
                let rotate = (seed as usize) % total;
                events.rotate_left(rotate);
            }
            let slicer = EventSlicer::new().group_by(ByStream).per_tenant();
            let groups = block_on(slicer.slice(&events)).unwrap();

            let mut seen: Vec<EventId> = groups
                .iter()
                .flat_map(|g| g.slices().flat_map(|s| s.events.iter().map(|e| e.id)))
                .collect();
            prop_assert_eq!(seen.len(), total);
            seen.sort();
            seen.dedup();
            prop_assert_eq!(seen.len(), total);

            for group in &groups {
                for slice in group.slices() {
                    prop_assert!(slice.events.iter().all(|e| e.stream == slice.id && e.tenant_id == group.tenant_id));
                    prop_assert!(slice.events.windows(2).all(|w| w[0].sequence <= w[1].sequence));
                }
            }
        }

        #[test]
        fn tenancy_split_commutes_with_identity_slicing(events in arbitrary_events()) {
            let split_first = block_on(EventSlicer::new().group_by(ByStream).per_tenant().slice(&events)).unwrap();
            let split_first: BTreeMap<(TenantId, StreamIdentity), Vec<EventId>> = split_first
                .iter()
                .flat_map(|g| g.slices().map(|s| ((g.tenant_id.clone(), s.id.clone()), s.events.iter().map(|e| e.id).collect())))
                .collect();

            let by_pair = EventSlicer::new()
                .group_by(ByIdentity::new(|e: &Event| Some(format!("{}|{}", e.tenant_id, e.stream))));
            let slices_first = block_on(by_pair.slice(&events)).unwrap();
            let slices_first: BTreeMap<String, Vec<EventId>> = slices_first
                .iter()
                .flat_map(|g| g.slices())
                .map(|s| (s.id.clone(), s.events.iter().map(|e| e.id).collect()))
                .collect();

            prop_assert_eq!(split_first.len(), slices_first.len());
            for ((tenant, stream), ids) in split_first {
                prop_assert_eq!(Some(&ids), slices_first.get(&format!("{tenant}|{stream}")));
            }
        }

        #[test]
        fn fan_out_expansion_is_deterministic(events in arbitrary_events()) {
            let slicer = EventSlicer::new()
                .group_by(ByStream)
                .fan_out(lines_rule(FanOutMode::AfterGrouping));

            let first = block_on(slicer.slice(&events)).unwrap();
            let second = block_on(slicer.slice(&events)).unwrap();
            let first = serde_json::to_string(&first[0].slices().flat_map(|s| s.events.clone()).collect::<Vec<_>>()).unwrap();
            let second = serde_json::to_string(&second[0].slices().flat_map(|s| s.events.clone()).collect::<Vec<_>>()).unwrap();
            prop_assert_eq!(first, second);
        }
    }
}
