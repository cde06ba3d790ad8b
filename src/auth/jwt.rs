use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

/// Extract the `exp` claim (epoch seconds) from a JWT access token.
///
/// Returns None for anything that does not parse as a JWT; callers treat
/// that as "expiry unknown, refresh now".
pub fn expiry(token: &str) -> Option<i64> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    parts.next()?;

    let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    claims.get("exp")?.as_i64()
}

/// Whether the token is still valid at `now + leeway_secs`.
pub fn is_valid(token: &str, leeway_secs: i64) -> bool {
    match expiry(token) {
        Some(exp) => exp >= chrono::Utc::now().timestamp() + leeway_secs,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_jwt(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{}}}"#, exp));
        format!("{}.{}.sig", header, payload)
    }

    #[test]
    fn test_expiry_extraction() {
        let token = make_jwt(1_900_000_000);
        assert_eq!(expiry(&token), Some(1_900_000_000));
    }

    #[test]
    fn test_not_a_jwt() {
        assert_eq!(expiry("ya29.opaque-google-token"), None);
        assert_eq!(expiry(""), None);
        assert_eq!(expiry("a.b"), None);
        assert!(!is_valid("not-a-jwt", 60));
    }

    #[test]
    fn test_validity_leeway() {
        let now = chrono::Utc::now().timestamp();
        assert!(is_valid(&make_jwt(now + 3600), 60));
        // Expires inside the leeway window: already considered stale.
        assert!(!is_valid(&make_jwt(now + 30), 60));
        assert!(!is_valid(&make_jwt(now - 10), 60));
    }
}
