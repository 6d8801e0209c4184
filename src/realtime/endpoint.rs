//! Realtime endpoint derivation from the HTTP API address

use tracing::warn;
use url::Url;

/// Local development endpoint used when nothing usable is configured
pub const FALLBACK_ENDPOINT: &str = "ws://localhost:3000/events";

const EVENTS_PATH: &str = "/events";

/// Work out the websocket endpoint.
///
/// A valid `ws`/`wss` override wins. Otherwise `api_base` must be an
/// `http`/`https` URL with a host; a trailing `/api` segment is dropped, the
/// scheme is mapped to `ws`/`wss` and `/events` appended. Anything else falls
/// back to [`FALLBACK_ENDPOINT`].
pub fn derive_endpoint(api_base: &str, ws_override: Option<&str>) -> Url {
    if let Some(raw) = ws_override.map(str::trim).filter(|s| !s.is_empty()) {
        match Url::parse(raw) {
            Ok(url) if matches!(url.scheme(), "ws" | "wss") && url.has_host() => return url,
            Ok(url) => warn!(
                ws_url = raw,
                scheme = url.scheme(),
                "Ignoring realtime endpoint override, not a ws/wss URL"
            ),
            Err(e) => warn!(ws_url = raw, error = %e, "Ignoring unparsable realtime endpoint override"),
        }
    }

    match from_api_base(api_base) {
        Ok(url) => url,
        Err(reason) => {
            warn!(
                api_base,
                reason = %reason,
                fallback = FALLBACK_ENDPOINT,
                "Realtime endpoint misconfigured, using local development endpoint"
            );
            fallback_endpoint()
        }
    }
}

pub fn fallback_endpoint() -> Url {
    Url::parse(FALLBACK_ENDPOINT).expect("fallback endpoint literal is a valid URL")
}

fn from_api_base(api_base: &str) -> Result<Url, String> {
    let base = Url::parse(api_base.trim()).map_err(|e| e.to_string())?;

    let scheme = match base.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(format!("unsupported scheme '{}'", other)),
    };
    if base.host_str().map_or(true, str::is_empty) {
        return Err("missing host".to_string());
    }

    let mut path = base.path().trim_end_matches('/');
    if let Some(stripped) = path.strip_suffix("/api") {
        path = stripped.trim_end_matches('/');
    }
    let path = format!("{}{}", path, EVENTS_PATH);

    let mut url = base.clone();
    url.set_scheme(scheme)
        .map_err(|_| format!("cannot switch scheme to '{}'", scheme))?;
    url.set_path(&path);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}
