use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::error::VaultError;

/// The opaque `state` value minted by the consent flow (§3.2) and handed
/// back verbatim by the IdP on callback. Encodes `{userId, sessionStateId}`
/// as `base64url(userId:sessionStateId)`. The legacy three-field shape
/// (`userId:taskId:persistentTokenId`) is not implemented — §9 requires
/// picking one shape and rejecting the other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateToken {
    pub user_id: String,
    pub session_state_id: String,
}

impl StateToken {
    pub fn encode(user_id: &str, session_state_id: &str) -> String {
        let raw = format!("{user_id}:{session_state_id}");
        URL_SAFE_NO_PAD.encode(raw.as_bytes())
    }

    /// Parses a state token, failing closed on malformed input: invalid
    /// base64, wrong separator count, or any empty field.
    pub fn parse(token: &str) -> Result<Self, VaultError> {
        let decoded = URL_SAFE_NO_PAD
            .decode(token.as_bytes())
            .map_err(|_| VaultError::invalid_request("malformed state token"))?;
        let raw = String::from_utf8(decoded)
            .map_err(|_| VaultError::invalid_request("malformed state token"))?;
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() != 2 {
            return Err(VaultError::invalid_request("malformed state token"));
        }
        let (user_id, session_state_id) = (parts[0], parts[1]);
        if user_id.is_empty() || session_state_id.is_empty() {
            return Err(VaultError::invalid_request("malformed state token"));
        }
        Ok(Self {
            user_id: user_id.to_string(),
            session_state_id: session_state_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let encoded = StateToken::encode("user-1", "sess-1");
        let decoded = StateToken::parse(&encoded).unwrap();
        assert_eq!(decoded.user_id, "user-1");
        assert_eq!(decoded.session_state_id, "sess-1");
    }

    #[test]
    fn rejects_invalid_base64() {
        assert!(StateToken::parse("not valid base64!!").is_err());
    }

    #[test]
    fn rejects_wrong_separator_count() {
        let encoded = URL_SAFE_NO_PAD.encode(b"just-one-field");
        assert!(StateToken::parse(&encoded).is_err());
        let encoded = URL_SAFE_NO_PAD.encode(b"a:b:c");
        assert!(StateToken::parse(&encoded).is_err());
    }

    #[test]
    fn rejects_empty_fields() {
        let encoded = URL_SAFE_NO_PAD.encode(b":sess-1");
        assert!(StateToken::parse(&encoded).is_err());
        let encoded = URL_SAFE_NO_PAD.encode(b"user-1:");
        assert!(StateToken::parse(&encoded).is_err());
    }
}
