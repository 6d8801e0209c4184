//! Loopback HTTP server receiving the provider's redirect
//!
//! Native clients register a `http://127.0.0.1[:port]/path` redirect URI; the
//! browser lands here after authorization and the full redirect URL is handed
//! to `SessionManager::handle_redirect`.

use axum::{extract::OriginalUri, response::Html, routing::get, Router};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::debug;
use url::{Host, Url};

use crate::error::CallbackError;

/// Listener bound to the redirect URI's loopback address
pub struct CallbackServer {
    listener: TcpListener,
    redirect_uri: Url,
}

impl CallbackServer {
    /// Bind the address named by `redirect_uri`. A missing or zero port picks a
    /// free one; `redirect_uri()` reports the address actually bound.
    pub async fn bind(redirect_uri: &str) -> Result<Self, CallbackError> {
        let invalid = || CallbackError::InvalidRedirect(redirect_uri.to_string());
        let mut url = Url::parse(redirect_uri).map_err(|_| invalid())?;
        if url.scheme() != "http" {
            return Err(invalid());
        }

        let ip = match url.host() {
            Some(Host::Ipv4(ip)) if ip.is_loopback() => IpAddr::V4(ip),
            Some(Host::Ipv6(ip)) if ip.is_loopback() => IpAddr::V6(ip),
            Some(Host::Domain("localhost")) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            _ => return Err(invalid()),
        };
        let addr = SocketAddr::new(ip, url.port().unwrap_or(0));

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| CallbackError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let bound = listener
            .local_addr()
            .map_err(|source| CallbackError::Bind {
                addr: addr.to_string(),
                source,
            })?;

        url.set_port(Some(bound.port())).map_err(|_| invalid())?;
        url.set_query(None);
        url.set_fragment(None);

        Ok(Self {
            listener,
            redirect_uri: url,
        })
    }

    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    /// Serve until the first request on the redirect path, returning its full URL
    pub async fn wait_for_redirect(self, timeout: Duration) -> Result<Url, CallbackError> {
        let (tx, rx) = oneshot::channel::<Url>();
        let tx = Arc::new(tokio::sync::Mutex::new(Some(tx)));

        let base = self.redirect_uri.clone();
        let handler = move |OriginalUri(uri): OriginalUri| async move {
            let Ok(url) = base.join(&uri.to_string()) else {
                return Html(FAILURE_PAGE);
            };
            let failed = url.query_pairs().any(|(key, _)| key == "error");

            if let Some(tx) = tx.lock().await.take() {
                let _ = tx.send(url);
            }

            Html(if failed { FAILURE_PAGE } else { SUCCESS_PAGE })
        };

        let app = Router::new().route(self.redirect_uri.path(), get(handler));

        debug!(redirect_uri = %self.redirect_uri, "Callback server listening");
        let listener = self.listener;
        let server = tokio::spawn(async move { axum::serve(listener, app).await });

        let result = tokio::select! {
            redirect = rx => redirect.map_err(|_| CallbackError::Closed),
            _ = tokio::time::sleep(timeout) => Err(CallbackError::Timeout(timeout)),
        };

        server.abort();
        let _ = tokio::time::timeout(Duration::from_secs(2), server).await;

        result
    }
}

const SUCCESS_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="UTF-8"><title>Signed in</title></head>
<body style="font-family: sans-serif; text-align: center; margin-top: 20vh">
    <h1>Signed in</h1>
    <p>You can close this window and return to the terminal.</p>
</body>
</html>"#;

const FAILURE_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="UTF-8"><title>Sign-in failed</title></head>
<body style="font-family: sans-serif; text-align: center; margin-top: 20vh">
    <h1>Sign-in failed</h1>
    <p>Return to the terminal for details.</p>
</body>
</html>"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_picks_port_and_keeps_path() {
        let server = CallbackServer::bind("http://127.0.0.1:0/callback").await.unwrap();
        let uri = server.redirect_uri();
        assert_eq!(uri.host_str(), Some("127.0.0.1"));
        assert_ne!(uri.port(), Some(0));
        assert_eq!(uri.path(), "/callback");
    }

    #[tokio::test]
    async fn test_bind_rejects_non_loopback() {
        for bad in [
            "http://example.com/callback",
            "https://127.0.0.1/callback",
            "not a url",
        ] {
            assert!(
                matches!(
                    CallbackServer::bind(bad).await,
                    Err(CallbackError::InvalidRedirect(_))
                ),
                "{}",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_returns_full_redirect_url() {
        let server = CallbackServer::bind("http://127.0.0.1/callback").await.unwrap();
        let target = format!("{}?code=abc&state=xyz", server.redirect_uri());
        let waiting = tokio::spawn(server.wait_for_redirect(Duration::from_secs(5)));

        let body = reqwest::get(&target).await.unwrap().text().await.unwrap();
        assert!(body.contains("Signed in"));

        let redirect = waiting.await.unwrap().unwrap();
        let pairs: Vec<(String, String)> = redirect.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("code".to_string(), "abc".to_string()),
                ("state".to_string(), "xyz".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_provider_error_page() {
        let server = CallbackServer::bind("http://127.0.0.1:0/").await.unwrap();
        let target = format!("{}?error=access_denied", server.redirect_uri());
        let waiting = tokio::spawn(server.wait_for_redirect(Duration::from_secs(5)));

        let body = reqwest::get(&target).await.unwrap().text().await.unwrap();
        assert!(body.contains("Sign-in failed"));
        assert!(waiting.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_times_out() {
        let server = CallbackServer::bind("http://127.0.0.1:0/callback").await.unwrap();
        let result = server.wait_for_redirect(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(CallbackError::Timeout(_))));
    }
}
