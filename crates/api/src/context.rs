use offerdesk_core::{OwnerId, Tenant};

/// Tenant context for a request.
///
/// Derived from the bearer token; immutable for the request's lifetime.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant: Tenant,
}

impl TenantContext {
    pub fn new(tenant: Tenant) -> Self {
        Self { tenant }
    }

    pub fn tenant(&self) -> Tenant {
        self.tenant
    }
}

/// Principal the request acts for; submitted jobs are owned by it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OwnerContext {
    owner_id: OwnerId,
}

impl OwnerContext {
    pub fn new(owner_id: OwnerId) -> Self {
        Self { owner_id }
    }

    pub fn owner_id(&self) -> OwnerId {
        self.owner_id
    }
}
