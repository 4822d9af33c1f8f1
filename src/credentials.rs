use reqwest::{Client, header::CONTENT_TYPE};
use tracing::{debug, warn};
use url::Url;

use crate::client::{ApiFuture, classify_failure, with_trailing_slash};
use crate::error::{Result, Stage, UploadError};
use crate::rest_types::{Account, TokenResponse};

pub const DEFAULT_API_BASE_URL: &str = "https://api.dropboxapi.com/2/";
pub const DEFAULT_OAUTH_BASE_URL: &str = "https://api.dropbox.com/oauth2/";

const CURRENT_ACCOUNT_ROUTE: &str = "users/get_current_account";
const TOKEN_ROUTE: &str = "token";

/// Supplies the bearer credential shared by every call of a batch.
pub trait TokenProvider: Sync {
    /// A token believed to be valid, refreshing it when necessary.
    fn token(&self) -> ApiFuture<'_, String>;

    /// Exchanges the long-lived refresh token for a new access token.
    fn refresh(&self) -> ApiFuture<'_, String>;
}

/// Where a refreshed access token is remembered between runs.
pub trait TokenCache: Send + Sync {
    fn load(&self) -> Option<String>;
    fn store(&self, token: &str);
}

/// Caches the access token in the OS keyring.
pub struct KeyringTokenCache {
    service: String,
    user: String,
}

impl KeyringTokenCache {
    pub fn new(service: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            user: user.into(),
        }
    }
}

impl TokenCache for KeyringTokenCache {
    fn load(&self) -> Option<String> {
        keyring::Entry::new(&self.service, &self.user)
            .and_then(|entry| entry.get_password())
            .map_err(|e| debug!(error = %e, "no cached access token"))
            .ok()
    }

    fn store(&self, token: &str) {
        let stored = keyring::Entry::new(&self.service, &self.user)
            .and_then(|entry| entry.set_password(token));
        if let Err(e) = stored {
            warn!(error = %e, "unable to cache access token in keyring");
        }
    }
}

#[derive(Debug, Clone)]
pub struct OAuthApp {
    pub app_key: String,
    pub app_secret: String,
    pub refresh_token: String,
}

pub struct DropboxTokenProvider {
    client: Client,
    api_base_url: Url,
    oauth_base_url: Url,
    app: Option<OAuthApp>,
    fixed_token: Option<String>,
    cache: Option<Box<dyn TokenCache>>,
}

impl DropboxTokenProvider {
    pub fn new(api_base_url: Url, oauth_base_url: Url) -> Self {
        Self {
            client: Client::new(),
            api_base_url: with_trailing_slash(api_base_url),
            oauth_base_url: with_trailing_slash(oauth_base_url),
            app: None,
            fixed_token: None,
            cache: None,
        }
    }

    pub fn with_app(mut self, app: OAuthApp) -> Self {
        self.app = Some(app);
        self
    }

    /// A token that is used as-is, skipping validation and refresh.
    pub fn with_fixed_token(mut self, token: String) -> Self {
        self.fixed_token = Some(token);
        self
    }

    pub fn with_cache(mut self, cache: Box<dyn TokenCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    fn url(&self, base: &Url, stage: Stage, route: &str) -> Result<Url> {
        base.join(route).map_err(|e| UploadError::Network {
            stage,
            file: String::new(),
            message: format!("failed to construct {route} URL: {e}"),
        })
    }

    /// Looks up the account `token` belongs to.
    pub async fn current_account(&self, token: &str) -> Result<Account> {
        let url = self.url(&self.api_base_url, Stage::Account, CURRENT_ACCOUNT_ROUTE)?;

        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .header(CONTENT_TYPE, "application/json")
            .body("null")
            .send()
            .await
            .map_err(|e| UploadError::Network {
                stage: Stage::Account,
                file: String::new(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_failure(Stage::Account, status, &text, None));
        }

        serde_json::from_str(&text).map_err(|e| UploadError::Network {
            stage: Stage::Account,
            file: String::new(),
            message: format!("invalid account response: {e}"),
        })
    }

    async fn is_valid(&self, token: &str) -> Result<bool> {
        match self.current_account(token).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_auth() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn exchange_refresh_token(&self) -> Result<String> {
        let app = self.app.as_ref().ok_or_else(|| UploadError::Auth {
            stage: Stage::TokenRefresh,
            message: "no refresh token configured".to_string(),
        })?;

        let url = self.url(&self.oauth_base_url, Stage::TokenRefresh, TOKEN_ROUTE)?;
        let response = self
            .client
            .post(url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", app.refresh_token.as_str()),
                ("client_id", app.app_key.as_str()),
                ("client_secret", app.app_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| UploadError::Network {
                stage: Stage::TokenRefresh,
                file: String::new(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            // The OAuth endpoint answers 400 invalid_grant for a revoked refresh token.
            if status.is_client_error() {
                return Err(UploadError::Auth {
                    stage: Stage::TokenRefresh,
                    message: format!("{} - {}", status, text.trim()),
                });
            }
            return Err(classify_failure(Stage::TokenRefresh, status, &text, None));
        }

        let token: TokenResponse =
            serde_json::from_str(&text).map_err(|e| UploadError::Network {
                stage: Stage::TokenRefresh,
                file: String::new(),
                message: format!("invalid token response: {e}"),
            })?;

        debug!(expires_in = ?token.expires_in, "access token refreshed");
        if let Some(cache) = &self.cache {
            cache.store(&token.access_token);
        }
        Ok(token.access_token)
    }
}

impl TokenProvider for DropboxTokenProvider {
    fn token(&self) -> ApiFuture<'_, String> {
        Box::pin(async move {
            if let Some(token) = &self.fixed_token {
                return Ok(token.clone());
            }

            let cached = self.cache.as_ref().and_then(|cache| cache.load());
            if let Some(token) = cached {
                if self.is_valid(&token).await? {
                    return Ok(token);
                }
                debug!("cached access token rejected, refreshing");
            }

            self.exchange_refresh_token().await
        })
    }

    fn refresh(&self) -> ApiFuture<'_, String> {
        Box::pin(self.exchange_refresh_token())
    }
}
