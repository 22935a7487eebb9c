use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Sign a Bybit v5 request.
///
/// The signed string is `timestamp + api_key + recv_window + payload`, where
/// payload is the query string for GET and the JSON body for POST.
/// Returns hex-encoded HMAC-SHA256.
pub fn sign_bybit(
    timestamp_ms: u64,
    api_key: &str,
    recv_window_ms: u64,
    payload: &str,
    secret: &str,
) -> Result<String, String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| format!("HMAC error: {}", e))?;
    mac.update(timestamp_ms.to_string().as_bytes());
    mac.update(api_key.as_bytes());
    mac.update(recv_window_ms.to_string().as_bytes());
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bybit_sign_shape() {
        let sig = sign_bybit(1_700_000_000_000, "key", 5000, "category=linear&symbol=ADAUSDT", "secret")
            .unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_bybit_sign_matches_concatenated_hmac() {
        let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
        mac.update(b"1700000000000key5000{\"a\":1}");
        let expected = hex::encode(mac.finalize().into_bytes());
        let sig = sign_bybit(1_700_000_000_000, "key", 5000, "{\"a\":1}", "secret").unwrap();
        assert_eq!(sig, expected);
    }

    #[test]
    fn test_payload_changes_signature() {
        let a = sign_bybit(1, "k", 5000, "a=1", "s").unwrap();
        let b = sign_bybit(1, "k", 5000, "a=2", "s").unwrap();
        assert_ne!(a, b);
    }
}
