//! Pairing-code generation.

use rand_core::{OsRng, RngCore};

/// Code alphabet: 32 unambiguous uppercase letters and digits.
///
/// `0/O` and `1/I` are excluded — pairing codes are read off one screen and
/// typed into another, often across the room.
pub const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of every pairing code.
pub const CODE_LENGTH: usize = 8;

/// Generate a cryptographically random pairing code.
///
/// Uses [`OsRng`] (a thin wrapper around the OS CSPRNG) to draw one byte per
/// character. The alphabet has 32 symbols and 32 divides 256 evenly, so the
/// byte reduction introduces no modulo bias.
pub fn generate_code() -> String {
    let mut bytes = [0u8; CODE_LENGTH];
    OsRng.fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| ALPHABET[(*b as usize) % ALPHABET.len()] as char)
        .collect()
}

/// Default display name for a node paired with `code`: `"Node "` followed by
/// the last six characters of the code.
pub fn default_node_name(code: &str) -> String {
    let suffix: String = code
        .chars()
        .rev()
        .take(6)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("Node {suffix}")
}

// ─── Tests ────────────────────────────────────────────────────────────────────
