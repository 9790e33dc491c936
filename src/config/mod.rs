// Configuration store: config.yaml on disk, shared handle in memory

use crate::error::{ProxyError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const ANTHROPIC_AUTH_URL: &str = "https://claude.ai/oauth/authorize";
pub const ANTHROPIC_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
pub const ANTHROPIC_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
pub const DEFAULT_REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,

    /// Where accounts.json lives. A leading `~` expands to the home dir.
    pub data_folder: String,

    pub admin_keys: Vec<String>,
    pub api_keys: Vec<String>,

    pub proxy_url: String,

    /// Overall deadline, non-streaming requests only.
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Per streamed chunk.
    pub read_timeout_secs: u64,
    pub request_retries: u32,

    pub session_idle_timeout_secs: u64,
    pub session_sweep_interval_secs: u64,
    pub max_sessions_per_account: usize,
    pub preserve_chats: bool,

    pub padtxt_length: usize,
    pub human_name: String,
    pub assistant_name: String,
    pub use_real_roles: bool,
    pub allow_external_images: bool,
    pub custom_prompt: String,

    pub oauth_client_id: String,
    pub oauth_authorize_url: String,
    pub oauth_token_url: String,
    pub oauth_redirect_uri: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8484,
            data_folder: "~/.claude-pool".to_string(),
            admin_keys: Vec::new(),
            api_keys: Vec::new(),
            proxy_url: String::new(),
            request_timeout_secs: 120,
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            request_retries: 3,
            session_idle_timeout_secs: 300,
            session_sweep_interval_secs: 30,
            max_sessions_per_account: 3,
            preserve_chats: false,
            padtxt_length: 0,
            human_name: "Human".to_string(),
            assistant_name: "Assistant".to_string(),
            use_real_roles: true,
            allow_external_images: false,
            custom_prompt: String::new(),
            oauth_client_id: ANTHROPIC_CLIENT_ID.to_string(),
            oauth_authorize_url: ANTHROPIC_AUTH_URL.to_string(),
            oauth_token_url: ANTHROPIC_TOKEN_URL.to_string(),
            oauth_redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
        }
    }
}

impl AppConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn session_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session_sweep_interval_secs)
    }

    pub fn resolve_data_folder(&self) -> PathBuf {
        expand_home(&self.data_folder)
    }

    pub fn accounts_path(&self) -> PathBuf {
        self.resolve_data_folder().join("accounts.json")
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Shared, mutable view of the configuration. The admin settings
/// endpoint replaces the mutable subset and persists back to disk.
#[derive(Clone)]
pub struct Settings {
    inner: Arc<RwLock<AppConfig>>,
    path: Option<Arc<PathBuf>>,
}

impl Settings {
    pub fn new(config: AppConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
            path: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| ProxyError::Internal(anyhow::anyhow!("read {:?}: {}", path, e)))?;
            serde_yaml::from_str(&content)
                .map_err(|e| ProxyError::RequestInvalid(format!("config parse: {}", e)))?
        } else {
            let config = AppConfig::default();
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Ok(content) = serde_yaml::to_string(&config) {
                let _ = std::fs::write(path, content);
            }
            config
        };
        tracing::info!("config loaded from {:?}", path);
        Ok(Self {
            inner: Arc::new(RwLock::new(config)),
            path: Some(Arc::new(path.to_path_buf())),
        })
    }

    pub fn get(&self) -> AppConfig {
        self.inner.read().clone()
    }

    pub fn update(&self, config: AppConfig) -> Result<()> {
        *self.inner.write() = config.clone();
        if let Some(path) = &self.path {
            let content = serde_yaml::to_string(&config)
                .map_err(|e| ProxyError::Internal(anyhow::anyhow!("config serialize: {}", e)))?;
            std::fs::write(path.as_ref(), content)
                .map_err(|e| ProxyError::Internal(anyhow::anyhow!("config write: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config: AppConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.port, 8484);
        assert_eq!(config.max_sessions_per_account, 3);
        assert_eq!(config.human_name, "Human");
        assert!(config.use_real_roles);
        assert_eq!(config.oauth_client_id, ANTHROPIC_CLIENT_ID);
    }

    #[test]
    fn kebab_case_keys_round_trip() {
        let yaml = "host: 0.0.0.0\nport: 9000\nmax-sessions-per-account: 5\npreserve-chats: true\n";
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_sessions_per_account, 5);
        assert!(config.preserve_chats);

        let out = serde_yaml::to_string(&config).unwrap();
        assert!(out.contains("max-sessions-per-account: 5"));
    }

    #[test]
    fn settings_update_replaces_snapshot() {
        let settings = Settings::new(AppConfig::default());
        let mut config = settings.get();
        config.padtxt_length = 4096;
        settings.update(config).unwrap();
        assert_eq!(settings.get().padtxt_length, 4096);
    }
}
