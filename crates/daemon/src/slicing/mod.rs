//! Event slicing: partitioning a page of events into per-identity slices.
//!
//! An [`EventSlicer`] combines grouping strategies ([`Grouper`]), optional
//! tenancy splitting, fan-out rules and enrichment hooks. Slicing is a pure
//! partition: every input event (and every fan-out child) lands in the slices
//! its grouping rules select, after de-duplication and ordering by sequence.

pub mod fan_out;
pub mod grouping;
pub mod slice;
pub mod slicer;

pub use fan_out::{FanOutMode, FanOutRule, FanOutRules};
pub use grouping::{ByIdentities, ByIdentity, ByLookup, ByStream, ByTenant, Grouper, IdentityLookup};
pub use slice::{EventSlice, SliceGroup, SliceIdentity, normalize_events};
pub use slicer::{EventSlicer, SliceEnricher, Tenancy};
