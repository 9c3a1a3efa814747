//! Device pairing and capability provisioning.
//!
//! A node joins the gateway in two steps: the owning account requests a
//! time-boxed one-time pairing code (`pairing.start`), transmits it
//! out-of-band (displayed / scanned on the device), and the same account
//! submits it back (`pairing.claim`). A successful claim atomically creates
//! the node record, consumes the request, and seeds the default capability
//! bundle.

pub mod code;
pub mod handlers;
pub mod model;
pub mod registry;
pub mod storage;

/// Errors surfaced by the pairing flow.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("UNAUTHENTICATED: authenticate with gateway.auth first")]
    Unauthenticated,
    /// Wrong code, foreign account, already claimed, or expired — the four
    /// causes are deliberately not distinguished, so the error channel cannot
    /// be used as a code-guessing oracle.
    #[error("PAIR_CODE_INVALID: pairing code invalid or expired")]
    InvalidOrExpiredCode,
    /// The node exists and the request is consumed, but one or more default
    /// capability rows could not be written. Re-driving the idempotent
    /// capability upsert is safe.
    #[error("PROVISIONING_INCOMPLETE: node {node_id} created but {missing} capability row(s) not written")]
    PartialProvisioning { node_id: String, missing: usize },
}
