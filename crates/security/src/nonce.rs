//! Per-response CSP nonces.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use common::{SecurityError, SecurityResult};
use ring::rand::{SecureRandom, SystemRandom};

/// Nonce length in bytes (128 bits).
pub const NONCE_LEN: usize = 16;

/// A single-use nonce.
///
/// `Debug` is redacted so the value never reaches a log line.
#[derive(Clone, PartialEq, Eq)]
pub struct Nonce(String);

impl Nonce {
    /// The base64 value, for rendering into `nonce="..."` attributes.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The source expression spliced into the policy.
    pub fn source_expression(&self) -> String {
        format!("'nonce-{}'", self.0)
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Nonce(..)")
    }
}

/// Generates nonces from the operating system CSPRNG.
#[derive(Clone)]
pub struct NonceGenerator {
    rng: SystemRandom,
}

impl NonceGenerator {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }

    /// Generate a fresh nonce.
    pub fn generate(&self) -> SecurityResult<Nonce> {
        let mut bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| SecurityError::internal("secure random source unavailable"))?;
        Ok(Nonce(STANDARD.encode(bytes)))
    }
}

impl Default for NonceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NonceGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonceGenerator").finish_non_exhaustive()
    }
}
