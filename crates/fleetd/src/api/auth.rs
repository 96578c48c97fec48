//! Caller identity.
//!
//! Authentication happens upstream; whatever authenticates the request puts a
//! [`CurrentUser`] into the request extensions. In dev mode the router
//! injects [`CurrentUser::dev_admin`] instead.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use crate::hosts::HostRecord;

pub const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub claims: Vec<String>,
}

impl CurrentUser {
    pub fn dev_admin() -> Self {
        Self {
            id: "dev".to_string(),
            username: "dev".to_string(),
            roles: vec![ADMIN_ROLE.to_string()],
            claims: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == ADMIN_ROLE)
    }

    /// Admins see every host; others need all of the host's required roles and claims.
    pub fn can_access(&self, host: &HostRecord) -> bool {
        self.is_admin()
            || (host.required_roles.iter().all(|r| self.roles.contains(r))
                && host.required_claims.iter().all(|c| self.claims.contains(c)))
    }
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or_else(|| ApiError::Unauthorized("missing caller identity".to_string()))
    }
}

/// Require the admin role.
#[derive(Debug, Clone)]
pub struct RequireAdmin(pub CurrentUser);

impl<S> FromRequestParts<S> for RequireAdmin
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = CurrentUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            return Err(ApiError::Forbidden("admin role required".to_string()));
        }
        Ok(RequireAdmin(user))
    }
}
