//! The default capability registry.
//!
//! A constant mapping from capability key to human-readable description.
//! Every node paired through the claim flow is granted this bundle; the
//! order below is the order capabilities are seeded and displayed.

/// The default capability bundle, in seeding/display order.
pub const DEFAULT_CAPABILITIES: [(&str, &str); 5] = [
    ("voice_wake", "Wake the agent hands-free with the wake word"),
    ("talk_mode", "Hold a continuous spoken conversation with the agent"),
    ("remote_exec", "Run approved commands and scripts on this node"),
    ("browser_proxy", "Browse the web through this node's network connection"),
    ("camera_capture", "Capture still frames from this node's camera"),
];

/// The default capability keys, in a fixed, deterministic order.
pub fn default_keys() -> Vec<&'static str> {
    DEFAULT_CAPABILITIES.iter().map(|(key, _)| *key).collect()
}

/// Human-readable description for a capability key.
///
/// Unrecognized keys are echoed back unchanged — display surfaces may hold
/// capability rows created by newer gateway versions, and a raw key is more
/// useful than an error.
pub fn describe<'a>(key: &'a str) -> &'a str {
    for (known, description) in DEFAULT_CAPABILITIES {
        if known == key {
            return description;
        }
    }
    key
}

// ─── Tests ────────────────────────────────────────────────────────────────────
