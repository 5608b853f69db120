//! Tenant scoping for jobs and quota.

use serde::{Deserialize, Serialize};

use crate::id::TenantId;

/// The principal a job is accounted against.
///
/// `System` covers jobs submitted through the external API without a
/// customer account. Quota and ownership logic must branch on the variant
/// explicitly; there is no reserved "system" tenant id.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Tenant {
    System,
    Account(TenantId),
}

impl Tenant {
    pub fn account(tenant_id: TenantId) -> Self {
        Self::Account(tenant_id)
    }

    /// The metered account, if any.
    pub fn account_id(&self) -> Option<TenantId> {
        match self {
            Tenant::System => None,
            Tenant::Account(id) => Some(*id),
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Tenant::System)
    }

    /// Path segment used to namespace stored artifacts.
    pub fn storage_segment(&self) -> String {
        match self {
            Tenant::System => "system".to_string(),
            Tenant::Account(id) => id.to_string(),
        }
    }
}

impl From<TenantId> for Tenant {
    fn from(value: TenantId) -> Self {
        Self::Account(value)
    }
}

impl core::fmt::Display for Tenant {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Tenant::System => f.write_str("system"),
            Tenant::Account(id) => write!(f, "account:{id}"),
        }
    }
}
