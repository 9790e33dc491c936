// Admin API: account management, settings, statistics

use super::handlers::authorized;
use super::AppState;
use crate::account::{Account, AuthType, Capability, PreferredAuth};
use crate::auth;
use crate::config::AppConfig;
use crate::error::{ProxyError, Result};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let config = state.services.settings.get();
    if authorized(headers, &config.admin_keys) {
        Ok(())
    } else {
        Err(ProxyError::Unauthorized)
    }
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Redacted account view: credential presence, never credential
/// values.
#[derive(Debug, Serialize)]
pub struct AccountView {
    pub organization_uuid: String,
    pub auth_type: AuthType,
    pub has_cookie: bool,
    pub has_oauth: bool,
    pub oauth_expires_at: Option<DateTime<Utc>>,
    pub capabilities: Vec<Capability>,
    pub preferred_auth: PreferredAuth,
    pub cooldowns: HashMap<String, DateTime<Utc>>,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AccountView {
    fn from(account: &Account) -> Self {
        let now = Utc::now();
        Self {
            organization_uuid: account.organization_uuid.clone(),
            auth_type: account.auth_type(now),
            has_cookie: account
                .cookie_value
                .as_deref()
                .is_some_and(|c| !c.is_empty()),
            has_oauth: account.oauth.is_some(),
            oauth_expires_at: account.oauth.as_ref().and_then(|t| t.expires_at),
            capabilities: account.capabilities.clone(),
            preferred_auth: account.preferred_auth,
            cooldowns: account.cooldowns.clone(),
            usage_count: account.usage_count,
            last_used_at: account.last_used_at,
            created_at: account.created_at,
            updated_at: account.updated_at,
        }
    }
}

pub async fn list_accounts(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = require_admin(&state, &headers) {
        return e.into_response();
    }
    let views: Vec<AccountView> = state
        .services
        .store
        .list()
        .iter()
        .map(AccountView::from)
        .collect();
    Json(views).into_response()
}

#[derive(Debug, Deserialize)]
pub struct CreateAccountBody {
    pub organization_uuid: Option<String>,
    pub cookie_value: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    pub preferred_auth: Option<PreferredAuth>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CreateAccountsBody {
    One(CreateAccountBody),
    Many(Vec<CreateAccountBody>),
}

/// Create accounts from a cookie paste or a batch import.
pub async fn create_accounts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateAccountsBody>,
) -> Response {
    if let Err(e) = require_admin(&state, &headers) {
        return e.into_response();
    }
    let entries = match body {
        CreateAccountsBody::One(entry) => vec![entry],
        CreateAccountsBody::Many(entries) => entries,
    };

    let mut created = Vec::new();
    for entry in entries {
        let id = entry
            .organization_uuid
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut account = Account::new(id);
        account.cookie_value = entry.cookie_value;
        if !entry.capabilities.is_empty() {
            account.capabilities = entry.capabilities;
        }
        if let Some(preferred) = entry.preferred_auth {
            account.preferred_auth = preferred;
        }
        match state.services.store.create(account) {
            Ok(account) => created.push(AccountView::from(&account)),
            Err(e) => return e.into_response(),
        }
    }
    Json(created).into_response()
}

#[derive(Debug, Deserialize)]
pub struct UpdateAccountBody {
    pub cookie_value: Option<String>,
    pub capabilities: Option<Vec<Capability>>,
    pub preferred_auth: Option<PreferredAuth>,
}

pub async fn update_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<UpdateAccountBody>,
) -> Response {
    if let Err(e) = require_admin(&state, &headers) {
        return e.into_response();
    }
    let result = state.services.store.update(&id, |account| {
        if let Some(cookie) = body.cookie_value.clone() {
            account.cookie_value = Some(cookie);
        }
        if let Some(capabilities) = body.capabilities.clone() {
            account.capabilities = capabilities;
        }
        if let Some(preferred) = body.preferred_auth {
            account.preferred_auth = preferred;
        }
    });
    match result {
        Ok(account) => Json(AccountView::from(&account)).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn delete_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = require_admin(&state, &headers) {
        return e.into_response();
    }
    match state.services.store.delete(&id) {
        Ok(()) => Json(json!({ "deleted": id })).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Hand the admin UI an authorization URL plus the PKCE verifier it
/// must echo back through the exchange endpoint.
pub async fn oauth_authorize_url(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = require_admin(&state, &headers) {
        return e.into_response();
    }
    let (url, oauth_state, verifier) = auth::authorize_url(&state.services.settings);
    Json(json!({
        "authorize_url": url,
        "state": oauth_state,
        "pkce_verifier": verifier,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct OAuthExchangeBody {
    pub organization_uuid: Option<String>,
    pub code: String,
    pub pkce_verifier: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

pub async fn oauth_exchange(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<OAuthExchangeBody>,
) -> Response {
    if let Err(e) = require_admin(&state, &headers) {
        return e.into_response();
    }
    match state
        .services
        .oauth
        .exchange_from_code(
            body.organization_uuid,
            &body.code,
            &body.pkce_verifier,
            body.capabilities,
        )
        .await
    {
        Ok(account) => Json(AccountView::from(&account)).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn reauthenticate_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = require_admin(&state, &headers) {
        return e.into_response();
    }
    match state.services.oauth.exchange_from_cookie(&id).await {
        Ok(account) => Json(AccountView::from(&account)).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn get_settings(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = require_admin(&state, &headers) {
        return e.into_response();
    }
    Json(state.services.settings.get()).into_response()
}

/// Replace the configuration and persist it. Transport-level options
/// (proxy, timeouts) take effect on the next server start.
pub async fn put_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(config): Json<AppConfig>,
) -> Response {
    if let Err(e) = require_admin(&state, &headers) {
        return e.into_response();
    }
    match state.services.settings.update(config) {
        Ok(()) => Json(state.services.settings.get()).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn statistics(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = require_admin(&state, &headers) {
        return e.into_response();
    }
    let session_counts = state.services.sessions.session_counts();
    let accounts: Vec<serde_json::Value> = state
        .services
        .store
        .list()
        .iter()
        .map(|account| {
            json!({
                "organization_uuid": account.organization_uuid,
                "usage_count": account.usage_count,
                "last_used_at": account.last_used_at,
                "cooldowns": account.cooldowns,
                "live_sessions": session_counts
                    .get(&account.organization_uuid)
                    .copied()
                    .unwrap_or(0),
            })
        })
        .collect();
    let total_usage: u64 = state
        .services
        .store
        .list()
        .iter()
        .map(|a| a.usage_count)
        .sum();

    Json(json!({
        "accounts": accounts,
        "total_usage": total_usage,
        "pending_tool_calls": state.services.tracker.pending_count(),
    }))
    .into_response()
}
