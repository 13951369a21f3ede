//! Identifier generation
//!
//! Provides:
//! - Random connection/viewer ids (hex)
//! - Time-ordered session ids (lexical sort approximates creation order)

use std::time::{SystemTime, UNIX_EPOCH};

/// Number of random bytes in a connection id (16 hex chars)
pub const CONNECTION_ID_BYTES: usize = 8;

/// Number of random bytes in a session id suffix
const SESSION_SUFFIX_BYTES: usize = 5;

/// Generate a random connection id (e.g. "9f3a1c0b4d2e8f61")
///
/// # Panics
/// Panics if the system random number generator fails (extremely rare).
/// Use `try_generate_connection_id` if you need to handle this case.
pub fn generate_connection_id() -> String {
    try_generate_connection_id().expect("RNG failed - system entropy source unavailable")
}

/// Try to generate a random connection id, returning an error if RNG fails
pub fn try_generate_connection_id() -> Result<String, getrandom::Error> {
    let mut bytes = [0u8; CONNECTION_ID_BYTES];
    getrandom::getrandom(&mut bytes)?;
    Ok(hex::encode(bytes))
}

/// Generate a session id whose lexical order approximates creation order.
///
/// Layout: 12 hex digits of millisecond timestamp, a dash, then a random
/// suffix for collision resistance (e.g. "018f2c3a9b10-4e7d21a0c3").
pub fn generate_session_id() -> String {
    try_generate_session_id().expect("RNG failed - system entropy source unavailable")
}

/// Try to generate a session id, returning an error if RNG fails
pub fn try_generate_session_id() -> Result<String, getrandom::Error> {
    let mut bytes = [0u8; SESSION_SUFFIX_BYTES];
    getrandom::getrandom(&mut bytes)?;
    Ok(format!("{:012x}-{}", unix_millis(), hex::encode(bytes)))
}

/// Current Unix time in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}

/// Current Unix time in seconds
pub fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
