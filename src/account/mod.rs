// Account model: identity, credentials, capabilities, quota state

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub mod store;

pub use store::AccountStore;

/// Clock skew applied when deciding whether an OAuth bundle needs a
/// refresh.
pub const OAUTH_EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Chat,
    ClaudePro,
    ClaudeMax,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferredAuth {
    #[default]
    Auto,
    Oauth,
    Web,
}

/// Derived view of which transports an account can currently serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    None,
    Oauth,
    Web,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Set when a refresh fails; cleared by a successful exchange.
    #[serde(default)]
    pub invalid: bool,
}

impl OAuthTokens {
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now + Duration::seconds(OAUTH_EXPIRY_SKEW_SECS) >= expires_at,
            None => false,
        }
    }

    pub fn usable(&self, now: DateTime<Utc>) -> bool {
        !self.invalid && (!self.needs_refresh(now) || self.refresh_token.is_some())
    }
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub organization_uuid: String,
    #[serde(default)]
    pub cookie_value: Option<String>,
    #[serde(default)]
    pub oauth: Option<OAuthTokens>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub preferred_auth: PreferredAuth,
    /// Per-model cooldown instants set after upstream rate limits.
    #[serde(default)]
    pub cooldowns: HashMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default = "default_version")]
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Fields written by newer versions survive a load/persist cycle.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Account {
    pub fn new(organization_uuid: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            organization_uuid: organization_uuid.into(),
            cookie_value: None,
            oauth: None,
            capabilities: vec![Capability::Chat],
            preferred_auth: PreferredAuth::Auto,
            cooldowns: HashMap::new(),
            usage_count: 0,
            last_used_at: None,
            version: 1,
            created_at: now,
            updated_at: now,
            extra: serde_json::Map::new(),
        }
    }

    pub fn auth_type(&self, now: DateTime<Utc>) -> AuthType {
        let oauth = self.oauth.as_ref().is_some_and(|t| t.usable(now));
        let web = self.cookie_value.as_deref().is_some_and(|c| !c.is_empty());
        match (oauth, web) {
            (true, true) => AuthType::Both,
            (true, false) => AuthType::Oauth,
            (false, true) => AuthType::Web,
            (false, false) => AuthType::None,
        }
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn cooldown_active(&self, model: &str, now: DateTime<Utc>) -> bool {
        self.cooldowns
            .get(model)
            .is_some_and(|until| *until > now)
    }

    /// Cooldowns only move forward for a given model.
    pub fn extend_cooldown(&mut self, model: &str, until: DateTime<Utc>) {
        let entry = self
            .cooldowns
            .entry(model.to_string())
            .or_insert(until);
        if until > *entry {
            *entry = until;
        }
    }
}
