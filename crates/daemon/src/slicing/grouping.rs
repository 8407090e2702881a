use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use skein_core::{EventId, TenantId};
use skein_events::{Event, StreamIdentity, TenantScoped};

use super::slice::{SliceGroup, SliceIdentity};
use crate::error::GroupingError;

/// One grouping strategy: route events into slices of `group`.
#[async_trait]
pub trait Grouper<Id: SliceIdentity>: Send + Sync {
    async fn group(&self, events: &[Event], group: &mut SliceGroup<Id>) -> Result<(), GroupingError>;
}

/// One slice per stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByStream;

#[async_trait]
impl Grouper<StreamIdentity> for ByStream {
    async fn group(&self, events: &[Event], group: &mut SliceGroup<StreamIdentity>) -> Result<(), GroupingError> {
        for event in events {
            group.add_event(event.stream.clone(), event.clone());
        }
        Ok(())
    }
}

/// One slice per tenant (tenant rollup).
#[derive(Debug, Clone, Copy, Default)]
pub struct ByTenant;

#[async_trait]
impl Grouper<TenantId> for ByTenant {
    async fn group(&self, events: &[Event], group: &mut SliceGroup<TenantId>) -> Result<(), GroupingError> {
        for event in events {
            group.add_event(event.tenant_id().clone(), event.clone());
        }
        Ok(())
    }
}

/// Identity computed from the event; `None` leaves the event out.
pub struct ByIdentity<Id, F> {
    identify: F,
    _id: PhantomData<fn() -> Id>,
}

impl<Id, F> ByIdentity<Id, F>
where
    F: Fn(&Event) -> Option<Id>,
{
    pub fn new(identify: F) -> Self {
        Self {
            identify,
            _id: PhantomData,
        }
    }
}

#[async_trait]
impl<Id, F> Grouper<Id> for ByIdentity<Id, F>
where
    Id: SliceIdentity,
    F: Fn(&Event) -> Option<Id> + Send + Sync,
{
    async fn group(&self, events: &[Event], group: &mut SliceGroup<Id>) -> Result<(), GroupingError> {
        for event in events {
            if let Some(id) = (self.identify)(event) {
                group.add_event(id, event.clone());
            }
        }
        Ok(())
    }
}

/// Several identities per event: one event updates many slices.
pub struct ByIdentities<Id, F> {
    identify: F,
    _id: PhantomData<fn() -> Id>,
}

impl<Id, F> ByIdentities<Id, F>
where
    F: Fn(&Event) -> Vec<Id>,
{
    pub fn new(identify: F) -> Self {
        Self {
            identify,
            _id: PhantomData,
        }
    }
}

#[async_trait]
impl<Id, F> Grouper<Id> for ByIdentities<Id, F>
where
    Id: SliceIdentity,
    F: Fn(&Event) -> Vec<Id> + Send + Sync,
{
    async fn group(&self, events: &[Event], group: &mut SliceGroup<Id>) -> Result<(), GroupingError> {
        for event in events {
            let mut ids = (self.identify)(event);
            ids.sort();
            ids.dedup();
            group.add_event_to_many(ids, event);
        }
        Ok(())
    }
}

/// Resolves identities from storage for events that do not carry them.
#[async_trait]
pub trait IdentityLookup<Id: SliceIdentity>: Send + Sync {
    /// Identities per event id; events missing from the map are left out.
    async fn resolve(&self, events: &[Event]) -> Result<HashMap<EventId, Vec<Id>>, GroupingError>;
}

/// Grouping through an [`IdentityLookup`], resolved once per page.
pub struct ByLookup<Id> {
    lookup: Arc<dyn IdentityLookup<Id>>,
}

impl<Id: SliceIdentity> ByLookup<Id> {
    pub fn new(lookup: Arc<dyn IdentityLookup<Id>>) -> Self {
        Self { lookup }
    }
}

#[async_trait]
impl<Id: SliceIdentity> Grouper<Id> for ByLookup<Id> {
    async fn group(&self, events: &[Event], group: &mut SliceGroup<Id>) -> Result<(), GroupingError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut resolved = self.lookup.resolve(events).await?;
        for event in events {
            if let Some(ids) = resolved.remove(&event.id) {
                group.add_event_to_many(ids, event);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn event(sequence: u64, stream: &str, tenant: &str) -> Event {
        Event {
            id: EventId::new(),
            sequence,
            version: 1,
            stream: StreamIdentity::key(stream),
            stream_type: None,
            tenant_id: TenantId::from(tenant),
            timestamp: Utc::now(),
            event_type: "shipment.sent".into(),
            causation_id: None,
            correlation_id: None,
            data: json!({ "orders": ["o1", "o2"] }),
        }
    }

    struct ShipmentOrders;

    #[async_trait]
    impl IdentityLookup<String> for ShipmentOrders {
        async fn resolve(&self, events: &[Event]) -> Result<HashMap<EventId, Vec<String>>, GroupingError> {
            Ok(events
                .iter()
                .filter(|e| e.stream.as_key() != Some("unknown"))
                .map(|e| (e.id, vec![format!("order-of-{}", e.stream)]))
                .collect())
        }
    }

    struct Broken;

    #[async_trait]
    impl IdentityLookup<String> for Broken {
        async fn resolve(&self, _: &[Event]) -> Result<HashMap<EventId, Vec<String>>, GroupingError> {
            Err(GroupingError::Lookup("connection reset".into()))
        }
    }

    #[tokio::test]
    async fn identities_fan_one_event_into_many_slices() {
        let grouper = ByIdentities::new(|e: &Event| -> Vec<String> {
            e.data["orders"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default()
        });

        let mut group = SliceGroup::new(TenantId::default_tenant());
        grouper.group(&[event(1, "s1", "t1")], &mut group).await.unwrap();
        assert_eq!(group.len(), 2);
        assert_eq!(group.event_count(), 2);
    }

    #[tokio::test]
    async fn lookup_grouping_skips_unresolved_events() {
        let grouper = ByLookup::<String>::new(Arc::new(ShipmentOrders));
        let mut group = SliceGroup::new(TenantId::default_tenant());
        grouper
            .group(&[event(1, "s1", "t1"), event(2, "unknown", "t1")], &mut group)
            .await
            .unwrap();

        assert_eq!(group.ids().cloned().collect::<Vec<_>>(), vec!["order-of-s1".to_string()]);
    }

    #[tokio::test]
    async fn lookup_failures_surface_as_grouping_errors() {
        let grouper = ByLookup::<String>::new(Arc::new(Broken));
        let mut group = SliceGroup::<String>::new(TenantId::default_tenant());
        let err = grouper.group(&[event(1, "s1", "t1")], &mut group).await.unwrap_err();
        assert!(matches!(err, GroupingError::Lookup(_)));
    }
}
