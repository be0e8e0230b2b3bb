//! Session unlock checks.
//!
//! [`SharedSecretGate`] is a plain exact-match comparison with no rate limiting.
//! Deployments needing real authentication implement [`Gate`] against their
//! identity provider instead.

use tracing::warn;

/// Decides whether a credential unlocks a session.
pub trait Gate: Send + Sync {
    fn check(&self, credential: &str) -> bool;
}

/// Accepts exactly one configured secret.
#[derive(Clone)]
pub struct SharedSecretGate {
    secret: String,
}

impl SharedSecretGate {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for SharedSecretGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecretGate").finish_non_exhaustive()
    }
}

impl Gate for SharedSecretGate {
    fn check(&self, credential: &str) -> bool {
        let matched = credential == self.secret;
        if !matched {
            warn!("Rejected session unlock attempt");
        }
        matched
    }
}

/// Accepts any credential. Used when no secret is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenGate;

impl Gate for OpenGate {
    fn check(&self, _credential: &str) -> bool {
        true
    }
}

/// Build the gate for an optional configured secret.
pub fn from_secret(secret: Option<&str>) -> Box<dyn Gate> {
    match secret {
        Some(secret) if !secret.is_empty() => Box::new(SharedSecretGate::new(secret)),
        _ => {
            warn!("No gate secret configured, sessions unlock without a password");
            Box::new(OpenGate)
        }
    }
}
