//! OAuth2 client-credentials tokens for Azure Resource Manager.

use ipfleet_core::{Error, Result};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Azure AD base URL
pub(crate) const LOGIN_BASE: &str = "https://login.microsoftonline.com";

const ARM_SCOPE: &str = "https://management.azure.com/.default";

/// Tokens are refreshed this long before they expire
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Service-principal token source with an in-memory cache
pub(crate) struct TokenSource {
    tenant_id: String,
    client_id: String,
    client_secret: String,
    login_base: String,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    pub(crate) fn new(tenant_id: &str, client_id: &str, client_secret: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            login_base: LOGIN_BASE.to_string(),
            cached: Mutex::new(None),
        }
    }

    pub(crate) fn set_login_base(&mut self, login_base: &str) {
        self.login_base = login_base.trim_end_matches('/').to_string();
    }

    pub(crate) fn client_id(&self) -> &str {
        &self.client_id
    }

    /// A valid bearer token, fetched on first use and when close to expiry
    pub(crate) async fn bearer(&self, client: &reqwest::Client) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && Instant::now() + EXPIRY_MARGIN < token.expires_at
        {
            return Ok(token.value.clone());
        }

        tracing::debug!("Requesting ARM token for client {}", self.client_id);

        let url = format!("{}/{}/oauth2/v2.0/token", self.login_base, self.tenant_id);
        let response = client
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", ARM_SCOPE),
            ])
            .send()
            .await
            .map_err(|e| Error::compute("azure", "token", format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                400 | 401 | 403 => Error::auth(format!(
                    "Azure AD rejected the service principal credentials (status {}): {}",
                    status, body
                )),
                429 => Error::rate_limited("Azure AD token endpoint"),
                _ => Error::compute("azure", "token", format!("{} - {}", status, body)),
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::compute("azure", "token", format!("invalid token response: {}", e)))?;

        let value = token.access_token.clone();
        *cached = Some(CachedToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(value)
    }
}
