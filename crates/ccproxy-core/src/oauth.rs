//! Access-token refresh and Cloud Code project discovery, memoized per
//! account in the pool.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use ccproxy_accounts::{Account, AccountPool};
use ccproxy_protocol::cloudcode::{
    ClientMetadata, LoadCodeAssistRequest, LoadCodeAssistResponse, OnboardUserRequest,
    OnboardUserResponse, TokenResponse,
};

use crate::builder::user_agent;
use crate::error::{DispatchError, DispatchResult};

/// Tokens this close to expiry are refreshed eagerly.
const TOKEN_EXPIRY_SLACK: Duration = Duration::from_secs(60);
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;
const ONBOARD_ATTEMPTS: u32 = 5;
const ONBOARD_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Serialize)]
struct RefreshGrant<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    grant_type: &'static str,
    refresh_token: &'a str,
}

pub struct AuthClient {
    http: wreq::Client,
    token_url: String,
}

impl AuthClient {
    pub fn new(token_url: String, proxy: Option<&str>) -> Result<Self, wreq::Error> {
        let mut builder = wreq::Client::builder().timeout(Duration::from_secs(30));
        if let Some(proxy) = proxy {
            builder = builder.proxy(wreq::Proxy::all(proxy)?);
        }
        Ok(Self {
            http: builder.build()?,
            token_url,
        })
    }

    /// Cached access token for `account`, refreshing when the stored expiry
    /// is less than a minute away.
    pub async fn access_token_for(
        &self,
        pool: &AccountPool,
        account: &Account,
    ) -> DispatchResult<String> {
        if let Some(token) = pool.cached_token(&account.email, TOKEN_EXPIRY_SLACK).await {
            return Ok(token);
        }

        debug!(event = "token_refresh", email = %account.email);
        let grant = RefreshGrant {
            client_id: &account.client_id,
            client_secret: &account.client_secret,
            grant_type: "refresh_token",
            refresh_token: &account.refresh_token,
        };
        let response = self
            .http
            .post(&self.token_url)
            .form(&grant)
            .send()
            .await
            .map_err(|err| DispatchError::NetworkError(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(event = "token_refresh_failed", email = %account.email, status = status.as_u16());
            return Err(DispatchError::AuthInvalid(format!(
                "refresh grant failed: {status}: {body}"
            )));
        }
        let payload: TokenResponse = response
            .json()
            .await
            .map_err(|err| DispatchError::AuthInvalid(err.to_string()))?;

        let lifetime = payload.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS).max(0) as u64;
        let expires_at = Instant::now() + Duration::from_secs(lifetime);
        pool.store_token(&account.email, payload.access_token.clone(), expires_at)
            .await;
        Ok(payload.access_token)
    }

    /// Cached project id for `account`, discovering it on first use.
    pub async fn project_for(
        &self,
        pool: &AccountPool,
        account: &Account,
        token: &str,
        endpoint: &str,
    ) -> DispatchResult<String> {
        if let Some(project) = pool.cached_project(&account.email).await {
            return Ok(project);
        }

        let project = self.discover_project(token, endpoint).await?;
        debug!(event = "project_discovered", email = %account.email, project = %project);
        pool.store_project(&account.email, project.clone()).await;
        Ok(project)
    }

    async fn discover_project(&self, token: &str, endpoint: &str) -> DispatchResult<String> {
        let load = self.load_code_assist(token, endpoint).await?;
        if load.current_tier.is_some()
            && let Some(project) = load.cloudaicompanion_project.filter(|p| !p.trim().is_empty())
        {
            return Ok(project);
        }

        // Accounts without a tier must be onboarded before they carry a
        // project; the call is long-running and polled.
        let tier_id = load
            .allowed_tiers
            .iter()
            .find(|tier| tier.is_default == Some(true))
            .and_then(|tier| tier.id.clone())
            .unwrap_or_else(|| "LEGACY".to_string());
        self.onboard_user(token, endpoint, tier_id).await
    }

    async fn load_code_assist(
        &self,
        token: &str,
        endpoint: &str,
    ) -> DispatchResult<LoadCodeAssistResponse> {
        let url = format!("{}/v1internal:loadCodeAssist", endpoint.trim_end_matches('/'));
        let body = serde_json::to_vec(&LoadCodeAssistRequest {
            metadata: ClientMetadata::default(),
        })
        .map_err(|err| DispatchError::NetworkError(err.to_string()))?;
        let response = self
            .http
            .post(url)
            .header("Authorization", format!("Bearer {token}"))
            .header("User-Agent", user_agent())
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|err| DispatchError::NetworkError(err.to_string()))?;
        let status = response.status();
        if status.as_u16() == 401 {
            return Err(DispatchError::AuthInvalid("loadCodeAssist: 401".to_string()));
        }
        if !status.is_success() {
            return Err(DispatchError::NetworkError(format!(
                "loadCodeAssist failed: {status}"
            )));
        }
        response
            .json()
            .await
            .map_err(|err| DispatchError::NetworkError(err.to_string()))
    }

    async fn onboard_user(
        &self,
        token: &str,
        endpoint: &str,
        tier_id: String,
    ) -> DispatchResult<String> {
        let url = format!("{}/v1internal:onboardUser", endpoint.trim_end_matches('/'));
        let body = serde_json::to_vec(&OnboardUserRequest {
            tier_id,
            metadata: ClientMetadata::default(),
        })
        .map_err(|err| DispatchError::NetworkError(err.to_string()))?;
        for _ in 0..ONBOARD_ATTEMPTS {
            let response = self
                .http
                .post(&url)
                .header("Authorization", format!("Bearer {token}"))
                .header("User-Agent", user_agent())
                .header("Content-Type", "application/json")
                .body(body.clone())
                .send()
                .await
                .map_err(|err| DispatchError::NetworkError(err.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(DispatchError::NetworkError(format!(
                    "onboardUser failed: {status}"
                )));
            }
            let payload: OnboardUserResponse = response
                .json()
                .await
                .map_err(|err| DispatchError::NetworkError(err.to_string()))?;
            if payload.done {
                let project = payload
                    .response
                    .and_then(|p| p.cloudaicompanion_project)
                    .and_then(|p| p.into_id());
                if let Some(project) = project.filter(|p| !p.trim().is_empty()) {
                    return Ok(project);
                }
                break;
            }
            tokio::time::sleep(ONBOARD_POLL_INTERVAL).await;
        }
        Err(DispatchError::AuthInvalid(
            "project discovery produced no project id".to_string(),
        ))
    }
}

/// 401 handling: both caches are dropped so the next attempt re-resolves.
pub async fn invalidate(pool: &AccountPool, email: &str) {
    pool.invalidate_token(email).await;
    pool.invalidate_project(email).await;
}
