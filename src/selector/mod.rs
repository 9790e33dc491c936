// Account selector: picks (account, transport) for a request

use crate::account::{Account, AccountStore, Capability, PreferredAuth};
use crate::api::models::MessagesRequest;
use crate::error::{ProxyError, Result};
use crate::tokens::{ensure_known_model, ModelTier};
use chrono::Utc;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

const AFFINITY_TTL: Duration = Duration::from_secs(3600);
const AFFINITY_CAP: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    OAuth,
    Web,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub account_id: String,
    pub transport: Transport,
}

/// Prompt-cache affinity fingerprint: prefix-stable content only
/// (system prompt plus all but the final turn). Recomputed on every
/// request.
pub fn fingerprint(request: &MessagesRequest) -> String {
    let mut hasher = Sha256::new();
    if let Some(system) = &request.system {
        if let Ok(bytes) = serde_json::to_vec(system) {
            hasher.update(&bytes);
        }
    }
    hasher.update([0u8]);
    let prefix_len = request.messages.len().saturating_sub(1);
    for message in &request.messages[..prefix_len] {
        if let Ok(bytes) = serde_json::to_vec(message) {
            hasher.update(&bytes);
        }
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

pub struct AccountSelector {
    store: Arc<AccountStore>,
    web_enabled: bool,
    affinity: Mutex<HashMap<String, (String, Instant)>>,
}

impl AccountSelector {
    pub fn new(store: Arc<AccountStore>, web_enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            store,
            web_enabled,
            affinity: Mutex::new(HashMap::new()),
        })
    }

    /// Pick an account and transport for the model, skipping anything
    /// in `exclude` (used for failover after quota observations).
    pub fn select(
        &self,
        model: &str,
        affinity_key: Option<&str>,
        exclude: &HashSet<String>,
    ) -> Result<Selection> {
        let tier = ensure_known_model(model)?;
        let now = Utc::now();
        let accounts = self.store.list();

        let eligible = |account: &Account| {
            !exclude.contains(&account.organization_uuid)
                && !account.cooldown_active(model, now)
        };

        let oauth_pool: Vec<&Account> = accounts
            .iter()
            .filter(|a| eligible(a))
            .filter(|a| a.preferred_auth != PreferredAuth::Web)
            .filter(|a| a.oauth.as_ref().is_some_and(|t| t.usable(now)))
            .filter(|a| oauth_capable(a, tier))
            .collect();

        let web_pool: Vec<&Account> = accounts
            .iter()
            .filter(|a| eligible(a))
            .filter(|_| self.web_enabled)
            .filter(|a| a.preferred_auth != PreferredAuth::Oauth)
            .filter(|a| a.cookie_value.as_deref().is_some_and(|c| !c.is_empty()))
            .collect();

        // OAuth has native features and no connection pressure, so it
        // wins whenever a candidate exists; otherwise fall through to
        // the web pool.
        let (pool, transport) = if !oauth_pool.is_empty() {
            (oauth_pool, Transport::OAuth)
        } else if !web_pool.is_empty() {
            (web_pool, Transport::Web)
        } else {
            return Err(ProxyError::NoAccountAvailable(model.to_string()));
        };

        let chosen = affinity_key
            .and_then(|key| self.affinity_account(key))
            .and_then(|preferred| {
                pool.iter()
                    .find(|a| a.organization_uuid == preferred)
                    .copied()
            })
            .unwrap_or_else(|| {
                pool.iter()
                    .min_by(|a, b| {
                        (a.usage_count, a.last_used_at, &a.organization_uuid).cmp(&(
                            b.usage_count,
                            b.last_used_at,
                            &b.organization_uuid,
                        ))
                    })
                    .copied()
                    .expect("pool is non-empty")
            });

        let selection = Selection {
            account_id: chosen.organization_uuid.clone(),
            transport,
        };
        self.store.touch_usage(&selection.account_id)?;
        if let Some(key) = affinity_key {
            self.record_affinity(key, &selection.account_id);
        }
        tracing::debug!(
            "selected account {}... via {:?} for {}",
            &selection.account_id[..selection.account_id.len().min(8)],
            selection.transport,
            model
        );
        Ok(selection)
    }

    fn affinity_account(&self, key: &str) -> Option<String> {
        let map = self.affinity.lock();
        map.get(key)
            .filter(|(_, at)| at.elapsed() < AFFINITY_TTL)
            .map(|(account, _)| account.clone())
    }

    pub fn record_affinity(&self, key: &str, account_id: &str) {
        let mut map = self.affinity.lock();
        if map.len() >= AFFINITY_CAP {
            map.retain(|_, (_, at)| at.elapsed() < AFFINITY_TTL);
            if map.len() >= AFFINITY_CAP {
                map.clear();
            }
        }
        map.insert(key.to_string(), (account_id.to_string(), Instant::now()));
    }
}

fn oauth_capable(account: &Account, tier: ModelTier) -> bool {
    match tier {
        ModelTier::Opus => account.has_capability(Capability::ClaudeMax),
        ModelTier::Sonnet | ModelTier::Haiku => {
            account.has_capability(Capability::ClaudePro)
                || account.has_capability(Capability::ClaudeMax)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::OAuthTokens;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    const SONNET: &str = "claude-3-5-sonnet-20241022";
    const OPUS: &str = "claude-opus-4-20250514";

    fn oauth_tokens() -> OAuthTokens {
        OAuthTokens {
            access_token: "at".to_string(),
            refresh_token: Some("rt".to_string()),
            expires_at: Some(Utc::now() + ChronoDuration::hours(4)),
            scopes: vec![],
            invalid: false,
        }
    }

    fn store() -> Arc<AccountStore> {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::load(dir.path().join("accounts.json")).unwrap();
        std::mem::forget(dir); // keep the tempdir alive for the test
        store
    }

    fn pro_account(id: &str) -> Account {
        let mut account = Account::new(id);
        account.capabilities = vec![Capability::Chat, Capability::ClaudePro];
        account.oauth = Some(oauth_tokens());
        account
    }

    fn max_account(id: &str) -> Account {
        let mut account = pro_account(id);
        account.capabilities = vec![Capability::Chat, Capability::ClaudeMax];
        account
    }

    fn cookie_account(id: &str) -> Account {
        let mut account = Account::new(id);
        account.cookie_value = Some("sk-ant-sid01-test".to_string());
        account
    }

    #[test]
    fn opus_requires_claude_max_over_oauth() {
        let store = store();
        store.create(pro_account("org-pro")).unwrap();
        let selector = AccountSelector::new(Arc::clone(&store), false);
        assert!(matches!(
            selector.select(OPUS, None, &HashSet::new()),
            Err(ProxyError::NoAccountAvailable(_))
        ));

        store.create(max_account("org-max")).unwrap();
        let selection = selector.select(OPUS, None, &HashSet::new()).unwrap();
        assert_eq!(selection.account_id, "org-max");
        assert_eq!(selection.transport, Transport::OAuth);
    }

    #[test]
    fn cooldown_excludes_the_pair() {
        let store = store();
        store.create(pro_account("org-a")).unwrap();
        store
            .mark_cooldown("org-a", SONNET, Utc::now() + ChronoDuration::seconds(120))
            .unwrap();
        let selector = AccountSelector::new(Arc::clone(&store), false);
        assert!(selector.select(SONNET, None, &HashSet::new()).is_err());
        // The cooldown binds (account, model), not the whole account.
        assert_eq!(
            selector
                .select("claude-3-5-haiku-20241022", None, &HashSet::new())
                .unwrap()
                .account_id,
            "org-a"
        );
        store.create(max_account("org-b")).unwrap();
        assert_eq!(
            selector.select(SONNET, None, &HashSet::new()).unwrap().account_id,
            "org-b"
        );
    }

    #[test]
    fn oauth_wins_over_web_unless_preference_forces_web() {
        let store = store();
        store.create(pro_account("org-oauth")).unwrap();
        store.create(cookie_account("org-web")).unwrap();
        let selector = AccountSelector::new(Arc::clone(&store), true);

        let selection = selector.select(SONNET, None, &HashSet::new()).unwrap();
        assert_eq!(selection.account_id, "org-oauth");
        assert_eq!(selection.transport, Transport::OAuth);

        store
            .update("org-oauth", |a| a.preferred_auth = PreferredAuth::Web)
            .unwrap();
        let selection = selector.select(SONNET, None, &HashSet::new()).unwrap();
        assert_eq!(selection.transport, Transport::Web);
    }

    #[test]
    fn least_used_account_wins_with_stable_tie_break() {
        let store = store();
        store.create(pro_account("org-a")).unwrap();
        store.create(pro_account("org-b")).unwrap();
        store.update("org-a", |a| a.usage_count = 5).unwrap();
        let selector = AccountSelector::new(Arc::clone(&store), false);

        let selection = selector.select(SONNET, None, &HashSet::new()).unwrap();
        assert_eq!(selection.account_id, "org-b");

        // Equal counters fall back to id order.
        store.update("org-a", |a| {
            a.usage_count = 6;
            a.last_used_at = None;
        })
        .unwrap();
        store.update("org-b", |a| {
            a.usage_count = 6;
            a.last_used_at = None;
        })
        .unwrap();
        let selection = selector.select(SONNET, None, &HashSet::new()).unwrap();
        assert_eq!(selection.account_id, "org-a");
    }

    #[test]
    fn web_fallback_when_oauth_pool_is_empty() {
        let store = store();
        store.create(cookie_account("org-web")).unwrap();
        let selector = AccountSelector::new(Arc::clone(&store), true);
        let selection = selector.select(SONNET, None, &HashSet::new()).unwrap();
        assert_eq!(selection.transport, Transport::Web);

        // With the web transport disabled at startup, nothing serves.
        let disabled = AccountSelector::new(Arc::clone(&store), false);
        assert!(disabled.select(SONNET, None, &HashSet::new()).is_err());
    }

    #[test]
    fn affinity_prefers_the_previous_account_when_eligible() {
        let store = store();
        store.create(pro_account("org-a")).unwrap();
        store.create(pro_account("org-b")).unwrap();
        // Skew usage so the balancer would pick org-b.
        store.update("org-a", |a| a.usage_count = 10).unwrap();
        let selector = AccountSelector::new(Arc::clone(&store), false);

        selector.record_affinity("fp-1", "org-a");
        let selection = selector.select(SONNET, Some("fp-1"), &HashSet::new()).unwrap();
        assert_eq!(selection.account_id, "org-a");

        // Affinity is soft: cooldown knocks the preferred account out.
        store
            .mark_cooldown("org-a", SONNET, Utc::now() + ChronoDuration::seconds(60))
            .unwrap();
        let selection = selector.select(SONNET, Some("fp-1"), &HashSet::new()).unwrap();
        assert_eq!(selection.account_id, "org-b");
    }

    #[test]
    fn exclusions_drive_failover() {
        let store = store();
        store.create(max_account("org-a")).unwrap();
        store.create(max_account("org-b")).unwrap();
        let selector = AccountSelector::new(Arc::clone(&store), false);

        let mut exclude = HashSet::new();
        exclude.insert("org-a".to_string());
        let selection = selector.select(OPUS, None, &exclude).unwrap();
        assert_eq!(selection.account_id, "org-b");

        exclude.insert("org-b".to_string());
        assert!(selector.select(OPUS, None, &exclude).is_err());
    }

    #[test]
    fn unknown_models_are_invalid() {
        let selector = AccountSelector::new(store(), true);
        assert!(matches!(
            selector.select("gpt-4o", None, &HashSet::new()),
            Err(ProxyError::RequestInvalid(_))
        ));
    }

    #[test]
    fn selection_bumps_usage_exactly_once() {
        let store = store();
        store.create(pro_account("org-a")).unwrap();
        let selector = AccountSelector::new(Arc::clone(&store), false);
        selector.select(SONNET, None, &HashSet::new()).unwrap();
        assert_eq!(store.get("org-a").unwrap().usage_count, 1);
    }

    #[test]
    fn fingerprint_is_prefix_stable() {
        let base: MessagesRequest = serde_json::from_value(json!({
            "model": SONNET,
            "system": "be brief",
            "messages": [
                {"role": "user", "content": "one"},
                {"role": "assistant", "content": "two"},
                {"role": "user", "content": "three"}
            ]
        }))
        .unwrap();
        let mut different_tail = base.clone();
        different_tail.messages.last_mut().unwrap().content =
            crate::api::models::MessageContent::Text("other".to_string());
        assert_eq!(fingerprint(&base), fingerprint(&different_tail));

        let mut different_prefix = base.clone();
        different_prefix.messages[0].content =
            crate::api::models::MessageContent::Text("changed".to_string());
        assert_ne!(fingerprint(&base), fingerprint(&different_prefix));
    }
}
