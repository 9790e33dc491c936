// Web session manager: live upstream conversations keyed by
// (account, conversation-key)

use crate::account::AccountStore;
use crate::config::Settings;
use crate::error::{ProxyError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

pub mod client;
pub mod transcript;

pub use client::{CompletionPayload, WebClient};

#[derive(Debug, Clone)]
struct WebSession {
    conversation_uuid: String,
    last_activity: Instant,
    active: bool,
}

#[derive(Default)]
struct AccountSessions {
    sessions: HashMap<String, WebSession>,
}

pub struct WebSessionManager {
    /// Self-handle so session handles can point back at the manager.
    me: Weak<WebSessionManager>,
    slots: RwLock<HashMap<String, Arc<Mutex<AccountSessions>>>>,
    client: Arc<WebClient>,
    store: Arc<AccountStore>,
    settings: Settings,
}

/// Result of `acquire`: either a live session or a reserved slot whose
/// upstream conversation the caller still has to open.
pub enum Acquired {
    Live(SessionHandle),
    Pending(Reservation),
}

impl Acquired {
    pub fn conversation_uuid(&self) -> &str {
        match self {
            Acquired::Live(handle) => &handle.conversation_uuid,
            Acquired::Pending(reservation) => &reservation.conversation_uuid,
        }
    }
}

/// An exclusive hold on a session. Dropping the handle releases it;
/// `keep_for_tool_result` preserves the upstream conversation so a
/// pending tool call can be delivered later.
pub struct SessionHandle {
    manager: Arc<WebSessionManager>,
    pub account_id: String,
    pub conversation_key: String,
    pub conversation_uuid: String,
    keep: AtomicBool,
    released: AtomicBool,
}

impl SessionHandle {
    pub fn keep_for_tool_result(&self) {
        self.keep.store(true, Ordering::SeqCst);
    }

    pub fn release(&self, keep: bool) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.manager
            .finish(&self.account_id, &self.conversation_key, keep);
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let keep = self.keep.load(Ordering::SeqCst);
        self.release(keep);
    }
}

/// A capacity slot claimed before the upstream conversation exists.
/// `confirm` turns it into a handle; dropping it unconfirmed frees
/// the slot.
pub struct Reservation {
    manager: Arc<WebSessionManager>,
    account_id: String,
    conversation_key: String,
    pub conversation_uuid: String,
    confirmed: bool,
}

impl Reservation {
    pub fn confirm(mut self) -> SessionHandle {
        self.confirmed = true;
        SessionHandle {
            manager: Arc::clone(&self.manager),
            account_id: self.account_id.clone(),
            conversation_key: self.conversation_key.clone(),
            conversation_uuid: self.conversation_uuid.clone(),
            keep: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.confirmed {
            self.manager
                .remove_entry(&self.account_id, &self.conversation_key);
        }
    }
}

impl WebSessionManager {
    pub fn new(client: Arc<WebClient>, store: Arc<AccountStore>, settings: Settings) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            slots: RwLock::new(HashMap::new()),
            client,
            store,
            settings,
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.me.upgrade().expect("session manager dropped")
    }

    pub fn client(&self) -> &Arc<WebClient> {
        &self.client
    }

    fn slot(&self, account_id: &str) -> Arc<Mutex<AccountSessions>> {
        if let Some(slot) = self.slots.read().get(account_id) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write();
        Arc::clone(
            slots
                .entry(account_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(AccountSessions::default()))),
        )
    }

    /// Claim the session for a conversation key. Fails fast with
    /// `session-busy` when the key is mid-request and with
    /// `session-exhausted` when the account is at capacity.
    pub fn acquire(&self, account_id: &str, conversation_key: &str) -> Result<Acquired> {
        let cap = self.settings.get().max_sessions_per_account;
        let slot = self.slot(account_id);
        let mut sessions = slot.lock();

        if let Some(session) = sessions.sessions.get_mut(conversation_key) {
            if session.active {
                return Err(ProxyError::SessionBusy);
            }
            session.active = true;
            session.last_activity = Instant::now();
            return Ok(Acquired::Live(SessionHandle {
                manager: self.arc(),
                account_id: account_id.to_string(),
                conversation_key: conversation_key.to_string(),
                conversation_uuid: session.conversation_uuid.clone(),
                keep: AtomicBool::new(false),
                released: AtomicBool::new(false),
            }));
        }

        if sessions.sessions.len() >= cap {
            return Err(ProxyError::SessionExhausted {
                retry_after_secs: self.settings.get().session_idle_timeout_secs,
            });
        }

        let conversation_uuid = uuid::Uuid::new_v4().to_string();
        sessions.sessions.insert(
            conversation_key.to_string(),
            WebSession {
                conversation_uuid: conversation_uuid.clone(),
                last_activity: Instant::now(),
                active: true,
            },
        );
        Ok(Acquired::Pending(Reservation {
            manager: self.arc(),
            account_id: account_id.to_string(),
            conversation_key: conversation_key.to_string(),
            conversation_uuid,
            confirmed: false,
        }))
    }

    /// Re-attach to a conversation kept alive for a pending tool call.
    /// The entry may have been re-keyed or dropped locally; the
    /// upstream conversation still exists, so adopt it under the
    /// caller's key when missing.
    pub fn adopt(
        &self,
        account_id: &str,
        conversation_key: &str,
        conversation_uuid: &str,
    ) -> Result<SessionHandle> {
        let cap = self.settings.get().max_sessions_per_account;
        let slot = self.slot(account_id);
        let mut sessions = slot.lock();

        let existing_key = sessions
            .sessions
            .iter()
            .find(|(_, s)| s.conversation_uuid == conversation_uuid)
            .map(|(k, _)| k.clone());

        let key = match existing_key {
            Some(key) => {
                let session = sessions.sessions.get_mut(&key).expect("key just found");
                if session.active {
                    return Err(ProxyError::SessionBusy);
                }
                session.active = true;
                session.last_activity = Instant::now();
                key
            }
            None => {
                if sessions.sessions.len() >= cap {
                    return Err(ProxyError::SessionExhausted {
                        retry_after_secs: self.settings.get().session_idle_timeout_secs,
                    });
                }
                sessions.sessions.insert(
                    conversation_key.to_string(),
                    WebSession {
                        conversation_uuid: conversation_uuid.to_string(),
                        last_activity: Instant::now(),
                        active: true,
                    },
                );
                conversation_key.to_string()
            }
        };

        Ok(SessionHandle {
            manager: self.arc(),
            account_id: account_id.to_string(),
            conversation_key: key,
            conversation_uuid: conversation_uuid.to_string(),
            keep: AtomicBool::new(false),
            released: AtomicBool::new(false),
        })
    }

    fn finish(&self, account_id: &str, conversation_key: &str, keep: bool) {
        let slot = self.slot(account_id);
        let removed = {
            let mut sessions = slot.lock();
            if keep {
                if let Some(session) = sessions.sessions.get_mut(conversation_key) {
                    session.active = false;
                    session.last_activity = Instant::now();
                }
                None
            } else {
                sessions.sessions.remove(conversation_key)
            }
        };
        if let Some(session) = removed {
            self.schedule_upstream_delete(account_id, session.conversation_uuid);
        }
    }

    fn remove_entry(&self, account_id: &str, conversation_key: &str) {
        let slot = self.slot(account_id);
        slot.lock().sessions.remove(conversation_key);
    }

    fn schedule_upstream_delete(&self, account_id: &str, conversation_uuid: String) {
        let Some(cookie) = self
            .store
            .get(account_id)
            .and_then(|a| a.cookie_value)
            .filter(|c| !c.is_empty())
        else {
            return;
        };
        let organization = account_id.to_string();
        let client = Arc::clone(&self.client);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = client
                    .delete_conversation(&cookie, &organization, &conversation_uuid)
                    .await
                {
                    tracing::warn!("upstream conversation delete failed: {}", e);
                }
            });
        }
    }

    /// One sweep pass: drop idle, inactive conversations. Returns how
    /// many entries were removed locally.
    pub fn sweep_once(&self) -> usize {
        let config = self.settings.get();
        let idle = config.session_idle_timeout();
        let preserve = config.preserve_chats;
        let slots: Vec<(String, Arc<Mutex<AccountSessions>>)> = self
            .slots
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let mut removed = 0;
        for (account_id, slot) in slots {
            let expired: Vec<(String, WebSession)> = {
                let mut sessions = slot.lock();
                let keys: Vec<String> = sessions
                    .sessions
                    .iter()
                    .filter(|(_, s)| !s.active && s.last_activity.elapsed() >= idle)
                    .map(|(k, _)| k.clone())
                    .collect();
                keys.into_iter()
                    .filter_map(|k| sessions.sessions.remove(&k).map(|s| (k, s)))
                    .collect()
            };
            for (key, session) in expired {
                removed += 1;
                tracing::debug!(
                    "reaped idle web session {} ({})",
                    key,
                    session.conversation_uuid
                );
                if !preserve {
                    self.schedule_upstream_delete(&account_id, session.conversation_uuid);
                }
            }
        }
        removed
    }

    pub fn session_counts(&self) -> HashMap<String, usize> {
        self.slots
            .read()
            .iter()
            .map(|(account, slot)| (account.clone(), slot.lock().sessions.len()))
            .collect()
    }

    #[cfg(test)]
    fn age_session(&self, account_id: &str, conversation_key: &str, by: std::time::Duration) {
        let slot = self.slot(account_id);
        let mut sessions = slot.lock();
        if let Some(session) = sessions.sessions.get_mut(conversation_key) {
            if let Some(earlier) = session.last_activity.checked_sub(by) {
                session.last_activity = earlier;
            }
        }
    }
}

/// Periodic reaper. Errors are logged inside `sweep_once` and never
/// stop the loop.
pub fn spawn_sweeper(manager: Arc<WebSessionManager>, settings: Settings) {
    tokio::spawn(async move {
        loop {
            let period = settings.get().session_sweep_interval();
            tokio::time::sleep(period).await;
            let removed = manager.sweep_once();
            if removed > 0 {
                tracing::info!("session sweeper removed {} idle conversations", removed);
            }
        }
    });
}
