//! Session identity and capability checks.
//!
//! Every mutating call presents an identity header; the validator
//! checks it against the roles the operation touches. Admin capability
//! bypasses role checks but is always audited.

use std::collections::{BTreeSet, HashMap};

use axum::http::HeaderMap;
use tracing::info;

use crate::response::ApiError;

/// Header carrying the caller's session identity.
pub const IDENTITY_HEADER: &str = "x-stratus-user";

pub trait CapabilityValidator: Send + Sync {
    /// Authorize `user` to mutate jobs owned by `role`.
    fn authorize(&self, user: &str, role: &str) -> Result<(), ApiError>;

    /// Authorize `user` for privileged (cluster-wide) operations.
    fn authorize_admin(&self, user: &str) -> Result<(), ApiError>;
}

/// Static membership tables: a user may act for their own role, for
/// roles they are a member of, and admins may act anywhere.
#[derive(Debug, Default)]
pub struct StaticAuth {
    role_members: HashMap<String, BTreeSet<String>>,
    admins: BTreeSet<String>,
}

impl StaticAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_member(mut self, role: &str, user: &str) -> Self {
        self.role_members
            .entry(role.to_string())
            .or_default()
            .insert(user.to_string());
        self
    }

    pub fn with_admin(mut self, user: &str) -> Self {
        self.admins.insert(user.to_string());
        self
    }
}

impl CapabilityValidator for StaticAuth {
    fn authorize(&self, user: &str, role: &str) -> Result<(), ApiError> {
        if self.admins.contains(user) {
            info!(user, role, "admin capability used for role operation");
            return Ok(());
        }
        if user == role {
            return Ok(());
        }
        if self
            .role_members
            .get(role)
            .is_some_and(|members| members.contains(user))
        {
            return Ok(());
        }
        Err(ApiError::AuthFailed(format!(
            "{user} is not authorized for role {role}"
        )))
    }

    fn authorize_admin(&self, user: &str) -> Result<(), ApiError> {
        if self.admins.contains(user) {
            info!(user, "admin capability used");
            return Ok(());
        }
        Err(ApiError::AuthFailed(format!(
            "{user} lacks admin capability"
        )))
    }
}

/// Pull the caller identity out of the request headers.
pub fn identity(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::AuthFailed("missing session identity".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_owner_is_authorized() {
        let auth = StaticAuth::new();
        auth.authorize("web-team", "web-team").unwrap();
        assert!(auth.authorize("intruder", "web-team").is_err());
    }

    #[test]
    fn members_and_admins_are_authorized() {
        let auth = StaticAuth::new()
            .with_member("web-team", "alice")
            .with_admin("root");
        auth.authorize("alice", "web-team").unwrap();
        auth.authorize("root", "web-team").unwrap();
        auth.authorize_admin("root").unwrap();
        assert!(auth.authorize_admin("alice").is_err());
    }

    #[test]
    fn identity_requires_the_header() {
        let mut headers = HeaderMap::new();
        assert!(identity(&headers).is_err());
        headers.insert(IDENTITY_HEADER, "alice".parse().unwrap());
        assert_eq!(identity(&headers).unwrap(), "alice");
    }
}
