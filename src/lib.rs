//! sessionlink
//!
//! Client-side session lifecycle for an OAuth (authorization code + PKCE)
//! protected service, and a realtime event channel that is open exactly while
//! the session holds a valid credential.
//!
//! - `auth`: PKCE material, token decoding, the session state machine
//! - `realtime`: endpoint derivation and the auth-gated websocket channel
//! - `store`: persistence for the credential and in-flight login state

pub mod auth;
pub mod config;
pub mod error;
pub mod realtime;
pub mod store;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests_session_channel;
