use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;

const TOKEN_BYTES: usize = 16;

/// Length of every token produced by [`generate_token`].
pub const TOKEN_LEN: usize = 22;

/// Generate an unguessable, URL-safe token (128 random bits, base64url).
///
/// Session ids double as the shareable invite parameter, so they must not be
/// enumerable.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn generate_session_id() -> String {
    generate_token()
}

pub fn generate_callee_id() -> String {
    generate_token()
}

/// Cheap shape check applied to ids supplied by clients before any lookup.
pub fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
