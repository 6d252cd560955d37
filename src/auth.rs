//! Caller authorization tiers.
//!
//! Authentication happens elsewhere. This module only answers how far an
//! already-identified caller may reach.

use crate::config::AuthConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// What a caller is allowed to publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContributorTier {
    /// May publish to the shared catalog.
    ApprovedContributor,
    /// May only keep books on their own device.
    Unapproved,
    /// Curates the shared catalog.
    Admin,
}

impl ContributorTier {
    /// Whether cloud writes are permitted at all.
    pub fn may_publish(self) -> bool {
        self != ContributorTier::Unapproved
    }
}

/// Source of caller tiers.
pub trait Authorizer: Send + Sync {
    /// Tier for a reader id. Anonymous callers pass `None`.
    fn tier(&self, reader_id: Option<&str>) -> ContributorTier;
}

/// Tiers looked up from the `[auth]` configuration section.
#[derive(Debug, Clone, Default)]
pub struct ConfigAuthorizer {
    admins: HashSet<String>,
    approved: HashSet<String>,
}

impl ConfigAuthorizer {
    /// Build from configuration.
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            admins: config.admins.iter().cloned().collect(),
            approved: config.approved.iter().cloned().collect(),
        }
    }

    /// Check if a reader is an admin.
    pub fn is_admin(&self, reader_id: &str) -> bool {
        self.admins.contains(reader_id)
    }
}

impl Authorizer for ConfigAuthorizer {
    fn tier(&self, reader_id: Option<&str>) -> ContributorTier {
        match reader_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) if self.is_admin(id) => ContributorTier::Admin,
            Some(id) if self.approved.contains(id) => ContributorTier::ApprovedContributor,
            _ => ContributorTier::Unapproved,
        }
    }
}
