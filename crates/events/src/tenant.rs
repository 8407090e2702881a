use skein_core::TenantId;

use crate::{Event, StreamAction};

/// Helper trait for tenant-scoped messages.
///
/// Tenancy-aware slicing splits a page of events by this value before any
/// identity grouping runs, so implementations must be cheap and stable.
pub trait TenantScoped {
    fn tenant_id(&self) -> &TenantId;
}

impl TenantScoped for Event {
    fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }
}

impl TenantScoped for StreamAction {
    fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }
}
