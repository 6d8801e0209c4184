//! Sending the user agent to the identity provider

use tracing::{info, warn};
use url::Url;

use crate::error::AuthError;

/// Performs the redirect to the provider's authorization page
pub trait Navigator: Send + Sync {
    fn redirect(&self, url: &Url) -> Result<(), AuthError>;
}

/// Opens the system browser, printing the URL when no browser can be launched
#[derive(Debug, Default, Clone, Copy)]
pub struct BrowserNavigator;

impl Navigator for BrowserNavigator {
    fn redirect(&self, url: &Url) -> Result<(), AuthError> {
        match webbrowser::open(url.as_str()) {
            Ok(()) => info!("Opened browser for authorization"),
            Err(e) => {
                warn!(error = %e, "Could not open a browser");
                eprintln!("\nPlease visit this URL in your browser:");
                eprintln!("{}\n", url);
            }
        }
        Ok(())
    }
}
