//! Identity provider client: authorization URL and code-for-token exchange

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::ProviderConfig;
use crate::error::AuthError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// The remote authorization server
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Where to send the user agent, carrying the S256 challenge and `state`
    fn authorization_url(&self, challenge: &str, state: &str) -> Url;

    /// Redeem an authorization code; returns the bearer access token
    async fn exchange_code(&self, code: &str, verifier: &str) -> Result<String, AuthError>;
}

/// OAuth token response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
}

/// OAuth error response (RFC 6749 section 5.2)
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Authorization-code + PKCE client over HTTPS
pub struct OAuthClient {
    client_id: String,
    redirect_uri: String,
    scope: String,
    authorize_endpoint: Url,
    token_endpoint: Url,
    http_client: reqwest::Client,
}

impl OAuthClient {
    pub fn new(config: &ProviderConfig) -> Result<Self, AuthError> {
        let authorize_endpoint = Url::parse(&config.authorize_endpoint).map_err(|e| {
            AuthError::InvalidConfig(format!(
                "authorize endpoint '{}': {}",
                config.authorize_endpoint, e
            ))
        })?;
        let token_endpoint = Url::parse(&config.token_endpoint).map_err(|e| {
            AuthError::InvalidConfig(format!("token endpoint '{}': {}", config.token_endpoint, e))
        })?;

        let http_client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("sessionlink/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AuthError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client_id: config.client_id.clone(),
            redirect_uri: config.redirect_uri.clone(),
            scope: config.scope.clone(),
            authorize_endpoint,
            token_endpoint,
            http_client,
        })
    }

    /// Point the redirect at a different callback, e.g. a loopback port picked at runtime
    pub fn set_redirect_uri(&mut self, redirect_uri: impl Into<String>) {
        self.redirect_uri = redirect_uri.into();
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }
}

#[async_trait]
impl IdentityProvider for OAuthClient {
    fn authorization_url(&self, challenge: &str, state: &str) -> Url {
        let mut url = self.authorize_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("scope", &self.scope)
            .append_pair("state", state)
            .append_pair("code_challenge", challenge)
            .append_pair("code_challenge_method", "S256");
        url
    }

    async fn exchange_code(&self, code: &str, verifier: &str) -> Result<String, AuthError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &self.redirect_uri),
            ("client_id", &self.client_id),
            ("code_verifier", verifier),
        ];

        let resp = self
            .http_client
            .post(self.token_endpoint.clone())
            .form(&params)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| AuthError::Network(format!("Token request failed: {}", e)))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            let detail = match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(err) => match err.error_description {
                    Some(desc) => format!("{}: {}", err.error, desc),
                    None => err.error,
                },
                Err(_) => body,
            };
            return Err(AuthError::Provider(format!(
                "Token exchange failed with status {}: {}",
                status, detail
            )));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| AuthError::Provider(format!("Failed to decode token response: {}", e)))?;

        debug!(token_type = ?token.token_type, "Token exchange succeeded");
        Ok(token.access_token)
    }
}
