use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC over `path` and the unix expiry, newline separated.
pub fn sign_path(secret: &str, path: &str, expires: i64) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(path.as_bytes());
    mac.update(b"\n");
    mac.update(expires.to_string().as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Checks signature and expiry; `now` is unix seconds.
pub fn verify_path(secret: &str, path: &str, expires: i64, signature: &str, now: i64) -> bool {
    if expires < now {
        return false;
    }
    let Some(expected) = sign_path(secret, path, expires) else {
        return false;
    };
    let provided = signature.to_ascii_lowercase();
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}
