//! PKCE verifier/challenge generation (S256)

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::AuthError;

const VERIFIER_BYTES: usize = 32;
const STATE_BYTES: usize = 16;

/// PKCE parameters for one authorization attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

/// Generates verifiers from the operating system's secure random source
#[derive(Debug, Clone, Copy)]
pub struct PkceGenerator(());

impl PkceGenerator {
    /// Create a generator, failing if no secure random source is available
    pub fn new() -> Result<Self, AuthError> {
        let mut probe = [0u8; 1];
        fill_secure(&mut probe)?;
        Ok(Self(()))
    }

    /// 32 random bytes, URL-safe base64 without padding
    pub fn generate_verifier(&self) -> Result<String, AuthError> {
        random_urlsafe(VERIFIER_BYTES)
    }

    /// Random value for the OAuth `state` parameter
    pub fn generate_state(&self) -> Result<String, AuthError> {
        random_urlsafe(STATE_BYTES)
    }

    pub fn generate_pair(&self) -> Result<PkcePair, AuthError> {
        let verifier = self.generate_verifier()?;
        let challenge = generate_challenge(&verifier);
        Ok(PkcePair {
            verifier,
            challenge,
        })
    }
}

/// `BASE64URL(SHA256(verifier))`, deterministic
pub fn generate_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

fn random_urlsafe(len: usize) -> Result<String, AuthError> {
    let mut bytes = vec![0u8; len];
    fill_secure(&mut bytes)?;
    Ok(URL_SAFE_NO_PAD.encode(&bytes))
}

fn fill_secure(buf: &mut [u8]) -> Result<(), AuthError> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| AuthError::RandomnessUnavailable(e.to_string()))
}
