// OAuth authentication against the upstream provider, with PKCE

use crate::account::{Account, AccountStore, Capability, OAuthTokens};
use crate::config::Settings;
use crate::error::{ProxyError, Result};
use crate::http::{ClientKind, HttpTransport};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

pub const OAUTH_SCOPES: &str = "org:create_api_key user:profile user:inference";

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
    pub organization: Option<Organization>,
    pub account: Option<AccountInfo>,
}

#[derive(Debug, Deserialize)]
pub struct Organization {
    pub uuid: String,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AccountInfo {
    pub uuid: Option<String>,
    pub email_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthorizeResponse {
    redirect_uri: String,
}

pub struct OAuthAuthenticator {
    http: Arc<HttpTransport>,
    store: Arc<AccountStore>,
    settings: Settings,
    /// Per-account refresh latches: the first caller runs the network
    /// refresh, late arrivals wait and reuse the stored result.
    latches: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl OAuthAuthenticator {
    pub fn new(http: Arc<HttpTransport>, store: Arc<AccountStore>, settings: Settings) -> Self {
        Self {
            http,
            store,
            settings,
            latches: Mutex::new(HashMap::new()),
        }
    }

    /// Exchange an authorization code for a token bundle and attach it
    /// to the target account, creating the account when needed.
    pub async fn exchange_from_code(
        &self,
        organization: Option<String>,
        code: &str,
        pkce_verifier: &str,
        capabilities: Vec<Capability>,
    ) -> Result<Account> {
        let (parsed_code, state) = parse_code_and_state(code);
        let config = self.settings.get();

        let mut body = serde_json::json!({
            "code": parsed_code,
            "grant_type": "authorization_code",
            "client_id": config.oauth_client_id,
            "redirect_uri": config.oauth_redirect_uri,
            "code_verifier": pkce_verifier,
        });
        if let Some(state) = state {
            body["state"] = serde_json::Value::String(state);
        }

        let token = self.post_token(&config.oauth_token_url, &body).await?;
        let organization_uuid = token
            .organization
            .as_ref()
            .map(|o| o.uuid.clone())
            .or(organization)
            .ok_or_else(|| {
                ProxyError::OAuthExchangeFailed(
                    "token response carries no organization".to_string(),
                )
            })?;

        let bundle = bundle_from(&token);
        let account = match self.store.get(&organization_uuid) {
            Some(_) => self.store.update(&organization_uuid, |account| {
                account.oauth = Some(bundle.clone());
                if !capabilities.is_empty() {
                    account.capabilities = capabilities.clone();
                }
            })?,
            None => {
                let mut account = Account::new(organization_uuid);
                account.oauth = Some(bundle);
                if !capabilities.is_empty() {
                    account.capabilities = capabilities;
                }
                self.store.upsert(account)
            }
        };
        tracing::info!(
            "oauth exchange complete for account {}...",
            &account.organization_uuid[..account.organization_uuid.len().min(8)]
        );
        Ok(account)
    }

    /// Bootstrap OAuth for an account that only has a session cookie:
    /// run the authorization flow headlessly over the browser-shaped
    /// client and exchange the resulting code.
    pub async fn exchange_from_cookie(&self, account_id: &str) -> Result<Account> {
        let account = self.store.get(account_id).ok_or_else(|| {
            ProxyError::RequestInvalid(format!("unknown account: {}", account_id))
        })?;
        let cookie = account
            .cookie_value
            .clone()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                ProxyError::OAuthExchangeFailed("account has no session cookie".to_string())
            })?;

        let config = self.settings.get();
        let verifier = generate_code_verifier();
        let challenge = generate_code_challenge(&verifier);
        let state = generate_random_string(32);

        let body = serde_json::json!({
            "response_type": "code",
            "client_id": config.oauth_client_id,
            "organization_uuid": account.organization_uuid,
            "redirect_uri": config.oauth_redirect_uri,
            "scope": OAUTH_SCOPES,
            "state": state,
            "code_challenge": challenge,
            "code_challenge_method": "S256",
        });

        let client = self.http.client(ClientKind::Fingerprinted)?;
        let response = self
            .http
            .send(
                client
                    .post(&config.oauth_authorize_url)
                    .header("cookie", cookie_header(&cookie))
                    .header("accept", "application/json")
                    .json(&body),
            )
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProxyError::OAuthExchangeFailed(format!(
                "authorize returned {}: {}",
                status, text
            )));
        }
        let authorize: AuthorizeResponse = response.json().await.map_err(|e| {
            ProxyError::OAuthExchangeFailed(format!("authorize response parse: {}", e))
        })?;
        let code = extract_code(&authorize.redirect_uri).ok_or_else(|| {
            ProxyError::OAuthExchangeFailed("authorize redirect carries no code".to_string())
        })?;

        self.exchange_from_code(
            Some(account.organization_uuid.clone()),
            &code,
            &verifier,
            Vec::new(),
        )
        .await
    }

    /// A valid access token for the account, refreshing or cookie-
    /// bootstrapping on demand.
    pub async fn access_token(&self, account_id: &str) -> Result<String> {
        let account = self.store.get(account_id).ok_or_else(|| {
            ProxyError::RequestInvalid(format!("unknown account: {}", account_id))
        })?;

        let tokens = match account.oauth {
            Some(tokens) => tokens,
            None => {
                let account = self.exchange_from_cookie(account_id).await?;
                account.oauth.ok_or_else(|| {
                    ProxyError::OAuthExchangeFailed("cookie bootstrap yielded no tokens".into())
                })?
            }
        };

        if tokens.invalid {
            return Err(ProxyError::OAuthRefreshFailed(
                "token bundle marked invalid".to_string(),
            ));
        }
        if tokens.needs_refresh(Utc::now()) {
            let refreshed = self.refresh(account_id).await?;
            return Ok(refreshed.access_token);
        }
        Ok(tokens.access_token)
    }

    /// Refresh the account's bundle. Deduplicated per account: only
    /// one network refresh runs, concurrent callers wait on the same
    /// latch and pick up the stored result.
    pub async fn refresh(&self, account_id: &str) -> Result<OAuthTokens> {
        let latch = {
            let mut latches = self.latches.lock();
            Arc::clone(
                latches
                    .entry(account_id.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        let _held = latch.lock().await;

        // A concurrent holder may already have refreshed.
        let account = self.store.get(account_id).ok_or_else(|| {
            ProxyError::RequestInvalid(format!("unknown account: {}", account_id))
        })?;
        let tokens = account.oauth.ok_or_else(|| {
            ProxyError::OAuthRefreshFailed("account has no token bundle".to_string())
        })?;
        if !tokens.invalid && !tokens.needs_refresh(Utc::now()) {
            return Ok(tokens);
        }
        let refresh_token = tokens.refresh_token.clone().ok_or_else(|| {
            ProxyError::OAuthRefreshFailed("bundle has no refresh token".to_string())
        })?;

        let config = self.settings.get();
        let body = serde_json::json!({
            "client_id": config.oauth_client_id,
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
        });

        match self.post_token(&config.oauth_token_url, &body).await {
            Ok(response) => {
                let mut bundle = bundle_from(&response);
                if bundle.refresh_token.is_none() {
                    bundle.refresh_token = Some(refresh_token);
                }
                if bundle.scopes.is_empty() {
                    bundle.scopes = tokens.scopes.clone();
                }
                let updated = self.store.update(account_id, |account| {
                    account.oauth = Some(bundle.clone());
                })?;
                tracing::info!(
                    "refreshed oauth tokens for account {}...",
                    &account_id[..account_id.len().min(8)]
                );
                updated.oauth.ok_or_else(|| {
                    ProxyError::OAuthRefreshFailed("bundle vanished during update".to_string())
                })
            }
            Err(e) => {
                // The selector will route this account via web until a
                // new exchange clears the flag.
                let _ = self.store.update(account_id, |account| {
                    if let Some(tokens) = account.oauth.as_mut() {
                        tokens.invalid = true;
                    }
                });
                tracing::warn!("oauth refresh failed for {}: {}", account_id, e);
                Err(ProxyError::OAuthRefreshFailed(e.to_string()))
            }
        }
    }

    async fn post_token(&self, url: &str, body: &serde_json::Value) -> Result<TokenResponse> {
        let client = self.http.client(ClientKind::Plain)?;
        let response = self
            .http
            .send(
                client
                    .post(url)
                    .header("content-type", "application/json")
                    .header("accept", "application/json")
                    .json(body),
            )
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProxyError::OAuthExchangeFailed(format!(
                "token endpoint returned {}: {}",
                status, text
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ProxyError::OAuthExchangeFailed(format!("token response parse: {}", e)))
    }
}

fn bundle_from(token: &TokenResponse) -> OAuthTokens {
    OAuthTokens {
        access_token: token.access_token.clone(),
        refresh_token: token.refresh_token.clone(),
        expires_at: token
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs as i64)),
        scopes: token
            .scope
            .as_deref()
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
        invalid: false,
    }
}

/// Authorization codes pasted from the provider may carry the state
/// after a `#` fragment.
pub fn parse_code_and_state(code: &str) -> (String, Option<String>) {
    match code.split_once('#') {
        Some((code, state)) => (code.to_string(), Some(state.to_string())),
        None => (code.to_string(), None),
    }
}

fn extract_code(redirect_uri: &str) -> Option<String> {
    let query = redirect_uri.split_once('?').map(|(_, q)| q)?;
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("code=") {
            return Some(value.split('#').next().unwrap_or(value).to_string());
        }
    }
    None
}

/// Cookie values may be pasted bare or as a full `sessionKey=` pair.
pub fn cookie_header(value: &str) -> String {
    if value.contains('=') {
        value.to_string()
    } else {
        format!("sessionKey={}", value)
    }
}

pub fn generate_random_string(length: usize) -> String {
    crate::api::models::random_token(length)
}

/// PKCE code verifier (43-128 characters).
pub fn generate_code_verifier() -> String {
    generate_random_string(64)
}

/// PKCE code challenge from verifier (S256 method).
pub fn generate_code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Build the interactive authorization URL for the admin flow. The
/// caller keeps the verifier to finish the exchange.
pub fn authorize_url(settings: &Settings) -> (String, String, String) {
    let config = settings.get();
    let state = generate_random_string(32);
    let verifier = generate_code_verifier();
    let challenge = generate_code_challenge(&verifier);
    let url = format!(
        "{}?code=true&client_id={}&response_type=code&redirect_uri={}&scope={}&code_challenge={}&code_challenge_method=S256&state={}",
        config.oauth_authorize_url,
        config.oauth_client_id,
        urlencoding::encode(&config.oauth_redirect_uri),
        urlencoding::encode(OAUTH_SCOPES),
        challenge,
        state
    );
    (url, state, verifier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn pkce_challenge_is_deterministic() {
        // RFC 7636 appendix B reference vector.
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            generate_code_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn verifier_length_is_within_rfc_bounds() {
        let verifier = generate_code_verifier();
        assert!(verifier.len() >= 43 && verifier.len() <= 128);
    }

    #[test]
    fn code_fragment_splits_into_state() {
        assert_eq!(
            parse_code_and_state("abc#xyz"),
            ("abc".to_string(), Some("xyz".to_string()))
        );
        assert_eq!(parse_code_and_state("abc"), ("abc".to_string(), None));
    }

    #[test]
    fn cookie_values_normalize() {
        assert_eq!(
            cookie_header("sk-ant-sid01-xyz"),
            "sessionKey=sk-ant-sid01-xyz"
        );
        assert_eq!(
            cookie_header("sessionKey=sk-ant-sid01-xyz"),
            "sessionKey=sk-ant-sid01-xyz"
        );
    }

    #[test]
    fn redirect_code_extraction() {
        assert_eq!(
            extract_code("https://console.anthropic.com/oauth/code/callback?code=ac_123&state=s"),
            Some("ac_123".to_string())
        );
        assert_eq!(extract_code("https://claude.ai/no-query"), None);
    }

    #[test]
    fn authorize_url_carries_pkce_params() {
        let settings = Settings::new(AppConfig::default());
        let (url, state, verifier) = authorize_url(&settings);
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains(&format!("state={}", state)));
        assert!(url.contains(&format!(
            "code_challenge={}",
            generate_code_challenge(&verifier)
        )));
    }

    #[tokio::test]
    async fn refresh_skips_network_when_bundle_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::load(dir.path().join("accounts.json")).unwrap();
        let mut account = crate::account::Account::new("org-fresh");
        account.oauth = Some(OAuthTokens {
            access_token: "still-good".to_string(),
            refresh_token: Some("rt".to_string()),
            expires_at: Some(Utc::now() + Duration::hours(2)),
            scopes: vec![],
            invalid: false,
        });
        store.create(account).unwrap();

        let settings = Settings::new(AppConfig::default());
        let http = Arc::new(HttpTransport::new(&settings.get()).unwrap());
        let auth = OAuthAuthenticator::new(http, Arc::clone(&store), settings);

        // Concurrent callers queue on the latch; neither touches the
        // network because the stored bundle is fresh.
        let (a, b) = tokio::join!(auth.refresh("org-fresh"), auth.refresh("org-fresh"));
        assert_eq!(a.unwrap().access_token, "still-good");
        assert_eq!(b.unwrap().access_token, "still-good");
    }
}
