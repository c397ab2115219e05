//! Tenant principal carried explicitly through every call path.
//!
//! There is no ambient request state: services take a [`TenantContext`] and
//! narrow every storage read/write by its `tenant_id`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of the authenticated principal within its tenant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    SuperAdmin,
    TenantAdmin,
    User,
}

impl UserRole {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::SuperAdmin => "super_admin",
            UserRole::TenantAdmin => "tenant_admin",
            UserRole::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "super_admin" => Some(UserRole::SuperAdmin),
            "tenant_admin" => Some(UserRole::TenantAdmin),
            "user" => Some(UserRole::User),
            _ => None,
        }
    }

    /// Tenant administrators (and platform admins) may change provider
    /// settings; plain users may not.
    #[must_use]
    pub fn can_manage_settings(&self) -> bool {
        matches!(self, UserRole::SuperAdmin | UserRole::TenantAdmin)
    }
}

/// The resolved principal of a request or background task.
///
/// Produced at the HTTP boundary by the [`crate::api::AuthVerifier`] seam and
/// then passed by value into services. The `correlation_id` is minted per
/// request and attached to logs for tracing unexpected failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub role: UserRole,
    pub correlation_id: Uuid,
}

impl TenantContext {
    #[must_use]
    pub fn new(tenant_id: Uuid, user_id: Uuid, role: UserRole) -> Self {
        Self {
            tenant_id,
            user_id,
            role,
            correlation_id: Uuid::new_v4(),
        }
    }
}
