//! GitHub webhook verification and event parsing.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const EVENT_HEADER: &str = "x-github-event";

type HmacSha256 = Hmac<Sha256>;

/// Check `X-Hub-Signature-256` against the raw body.
///
/// With no secret configured every delivery is accepted. The comparison is
/// constant-time.
pub fn verify_signature(secret: Option<&str>, body: &[u8], header: Option<&str>) -> bool {
    let Some(secret) = secret.filter(|s| !s.is_empty()) else {
        return true;
    };
    let Some(hex_digest) = header.and_then(|h| h.trim().strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// `sha256=<hex>` signature for `body`, as GitHub would send it.
pub fn sign(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    Ping,
    /// Push to `repo`; `branch` is `None` for tag pushes.
    Push { repo: String, branch: Option<String> },
    Ignored(String),
}

#[derive(Deserialize)]
struct PushPayload {
    #[serde(rename = "ref", default)]
    git_ref: String,
    repository: PushRepository,
}

#[derive(Deserialize)]
struct PushRepository {
    full_name: String,
}

/// Interpret a delivery. A push payload that cannot be parsed is an error;
/// unknown or missing event types are ignored.
pub fn parse_event(event: Option<&str>, body: &[u8]) -> Result<WebhookEvent, serde_json::Error> {
    match event.map(str::trim) {
        Some("ping") => Ok(WebhookEvent::Ping),
        Some("push") => {
            let payload: PushPayload = serde_json::from_slice(body)?;
            let branch = payload
                .git_ref
                .strip_prefix("refs/heads/")
                .map(str::to_string);
            Ok(WebhookEvent::Push {
                repo: payload.repository.full_name,
                branch,
            })
        }
        Some(other) => Ok(WebhookEvent::Ignored(other.to_string())),
        None => Ok(WebhookEvent::Ignored("unknown".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"ref":"refs/heads/main","repository":{"full_name":"acme/app"}}"#;

    #[test]
    fn test_signature_round_trip() {
        let header = sign("s3cret", BODY).unwrap();
        assert!(header.starts_with("sha256="));
        assert!(verify_signature(Some("s3cret"), BODY, Some(&header)));
        assert!(!verify_signature(Some("other"), BODY, Some(&header)));
        assert!(!verify_signature(Some("s3cret"), b"tampered", Some(&header)));
    }

    #[test]
    fn test_signature_rejects_malformed_headers() {
        assert!(!verify_signature(Some("s3cret"), BODY, None));
        assert!(!verify_signature(Some("s3cret"), BODY, Some("sha1=abcd")));
        assert!(!verify_signature(Some("s3cret"), BODY, Some("sha256=not-hex")));
        assert!(!verify_signature(Some("s3cret"), BODY, Some("sha256=abcd")));
    }

    #[test]
    fn test_no_secret_accepts_everything() {
        assert!(verify_signature(None, BODY, None));
        assert!(verify_signature(Some(""), BODY, Some("garbage")));
    }

    #[test]
    fn test_parse_push() {
        assert_eq!(
            parse_event(Some("push"), BODY).unwrap(),
            WebhookEvent::Push {
                repo: "acme/app".into(),
                branch: Some("main".into())
            }
        );
        let tag = br#"{"ref":"refs/tags/v1","repository":{"full_name":"acme/app"}}"#;
        assert!(matches!(
            parse_event(Some("push"), tag).unwrap(),
            WebhookEvent::Push { branch: None, .. }
        ));
        assert!(parse_event(Some("push"), b"{}").is_err());
    }

    #[test]
    fn test_parse_other_events() {
        assert_eq!(parse_event(Some("ping"), b"{}").unwrap(), WebhookEvent::Ping);
        assert_eq!(
            parse_event(Some("issues"), b"{}").unwrap(),
            WebhookEvent::Ignored("issues".into())
        );
        assert!(matches!(parse_event(None, b"").unwrap(), WebhookEvent::Ignored(_)));
    }
}
