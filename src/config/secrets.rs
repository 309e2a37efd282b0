//! Secret handling utilities.
//!
//! Re-exports secrecy types so callers don't need the crate directly.

pub use secrecy::{ExposeSecret, SecretString};

/// Expose an optional secret as an owned string, empty when unset.
pub fn expose_or_empty(secret: Option<&SecretString>) -> String {
    secret.map(|s| s.expose_secret().to_string()).unwrap_or_default()
}
