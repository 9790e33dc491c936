// Account store: in-memory map with write-through JSON persistence

use super::Account;
use crate::error::{ProxyError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

pub struct AccountStore {
    /// Self-handle for the background writer task.
    me: Weak<AccountStore>,
    path: PathBuf,
    accounts: RwLock<HashMap<String, Account>>,
    dirty: AtomicBool,
    writing: AtomicBool,
    write_gate: tokio::sync::Mutex<()>,
}

impl AccountStore {
    /// Load the store from `accounts.json`, or start empty when the
    /// file does not exist yet.
    pub fn load(path: PathBuf) -> Result<Arc<Self>> {
        let accounts = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| ProxyError::Internal(anyhow::anyhow!("read {:?}: {}", path, e)))?;
            let list: Vec<Account> = serde_json::from_str(&content).map_err(|e| {
                ProxyError::Internal(anyhow::anyhow!("parse {:?}: {}", path, e))
            })?;
            tracing::info!("loaded {} accounts from {:?}", list.len(), path);
            list.into_iter()
                .map(|a| (a.organization_uuid.clone(), a))
                .collect()
        } else {
            HashMap::new()
        };
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            path,
            accounts: RwLock::new(accounts),
            dirty: AtomicBool::new(false),
            writing: AtomicBool::new(false),
            write_gate: tokio::sync::Mutex::new(()),
        }))
    }

    /// Snapshot of all accounts in stable id order.
    pub fn list(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> = self.accounts.read().values().cloned().collect();
        accounts.sort_by(|a, b| a.organization_uuid.cmp(&b.organization_uuid));
        accounts
    }

    pub fn get(&self, id: &str) -> Option<Account> {
        self.accounts.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.accounts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.read().is_empty()
    }

    pub fn create(&self, account: Account) -> Result<Account> {
        {
            let mut accounts = self.accounts.write();
            if accounts.contains_key(&account.organization_uuid) {
                return Err(ProxyError::RequestInvalid(format!(
                    "account {} already exists",
                    account.organization_uuid
                )));
            }
            accounts.insert(account.organization_uuid.clone(), account.clone());
        }
        self.schedule_persist();
        Ok(account)
    }

    /// Insert-or-replace, used by the OAuth exchange path which may
    /// target a new or an existing organization.
    pub fn upsert(&self, account: Account) -> Account {
        {
            let mut accounts = self.accounts.write();
            accounts.insert(account.organization_uuid.clone(), account.clone());
        }
        self.schedule_persist();
        account
    }

    pub fn update<F>(&self, id: &str, mutate: F) -> Result<Account>
    where
        F: FnOnce(&mut Account),
    {
        let updated = {
            let mut accounts = self.accounts.write();
            let account = accounts.get_mut(id).ok_or_else(|| {
                ProxyError::RequestInvalid(format!("unknown account: {}", id))
            })?;
            mutate(account);
            account.updated_at = Utc::now();
            account.clone()
        };
        self.schedule_persist();
        Ok(updated)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let removed = self.accounts.write().remove(id);
        if removed.is_none() {
            return Err(ProxyError::RequestInvalid(format!("unknown account: {}", id)));
        }
        self.schedule_persist();
        Ok(())
    }

    /// Record an upstream rate limit for (account, model). Monotonic
    /// per pair.
    pub fn mark_cooldown(
        &self,
        id: &str,
        model: &str,
        until: DateTime<Utc>,
    ) -> Result<()> {
        self.update(id, |account| account.extend_cooldown(model, until))
            .map(|_| ())
    }

    /// Bump the load-balancing counters; called once per served
    /// request at selection time.
    pub fn touch_usage(&self, id: &str) -> Result<()> {
        self.update(id, |account| {
            account.usage_count += 1;
            account.last_used_at = Some(Utc::now());
        })
        .map(|_| ())
    }

    /// Coalesced write-through: at most one writer task runs; further
    /// mutations mark the store dirty and the running writer drains
    /// the flag before exiting.
    fn schedule_persist(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        if self.writing.swap(true, Ordering::SeqCst) {
            return;
        }
        match (tokio::runtime::Handle::try_current(), self.me.upgrade()) {
            (Ok(handle), Some(store)) => {
                handle.spawn(async move {
                    while store.dirty.swap(false, Ordering::SeqCst) {
                        if let Err(e) = store.persist().await {
                            tracing::error!("account persistence failed: {}", e);
                        }
                    }
                    store.writing.store(false, Ordering::SeqCst);
                    if store.dirty.load(Ordering::SeqCst) {
                        store.schedule_persist();
                    }
                });
            }
            _ => {
                // No runtime (tests, shutdown path): write inline.
                while self.dirty.swap(false, Ordering::SeqCst) {
                    if let Err(e) = self.write_file() {
                        tracing::error!("account persistence failed: {}", e);
                    }
                }
                self.writing.store(false, Ordering::SeqCst);
            }
        }
    }

    pub async fn persist(&self) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        self.write_file()
    }

    /// Atomic write: temp file in the same directory, then rename.
    fn write_file(&self) -> Result<()> {
        let accounts = self.list();
        let content = serde_json::to_string_pretty(&accounts)
            .map_err(|e| ProxyError::Internal(anyhow::anyhow!("serialize accounts: {}", e)))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ProxyError::Internal(anyhow::anyhow!("create data dir: {}", e)))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .map_err(|e| ProxyError::Internal(anyhow::anyhow!("write {:?}: {}", tmp, e)))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| ProxyError::Internal(anyhow::anyhow!("rename {:?}: {}", tmp, e)))?;
        tracing::debug!("persisted {} accounts to {:?}", accounts.len(), self.path);
        Ok(())
    }
}
