use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

/// Random bytes per share id: 128 bits, 22 URL-safe characters.
pub const SHARE_ID_BYTES: usize = 16;

pub fn generate_share_id() -> String {
    let bytes: [u8; SHARE_ID_BYTES] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}
