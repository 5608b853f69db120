//! `offerdesk-core` — shared building blocks for the PDF job subsystem.
//!
//! This crate contains **pure** primitives (no infrastructure concerns):
//! identifiers, tenant scoping, quota periods and the clock abstraction.

pub mod clock;
pub mod error;
pub mod id;
pub mod period;
pub mod tenant;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, OwnerId, TenantId};
pub use period::QuotaPeriod;
pub use tenant::Tenant;
