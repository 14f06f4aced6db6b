//! Request authenticator (C4): Bearer extraction, introspection, and
//! identity extraction for inbound calls.

use crate::idp::IdpClient;

/// Result of validating an inbound request. Callers MUST NOT map `Valid`
/// to a 2xx response without explicitly checking which variant they got.
#[derive(Debug, Clone)]
pub enum Validation {
    Valid { user_id: String, session_id: String, access_token: String },
    Invalid { reason: String },
}

/// Splits `Authorization: Bearer <token>` on a single space, requiring
/// exactly two parts with the first literally `Bearer` (§4.4).
fn parse_bearer(header: &str) -> Option<&str> {
    let parts: Vec<&str> = header.split(' ').collect();
    if parts.len() != 2 || parts[0] != "Bearer" || parts[1].is_empty() {
        return None;
    }
    Some(parts[1])
}

/// Extracts `Bearer <token>` from an `Authorization` header value, calls
/// C3 `introspect`, and yields a tagged result.
pub async fn authenticate(idp: &IdpClient, authorization: Option<&str>) -> Validation {
    let Some(header) = authorization else {
        return Validation::Invalid { reason: "missing_bearer_token".to_string() };
    };

    let Some(token) = parse_bearer(header) else {
        return Validation::Invalid { reason: "invalid_bearer_token".to_string() };
    };

    match idp.introspect(token).await {
        Ok(introspection) if !introspection.active => {
            Validation::Invalid { reason: "token_not_active".to_string() }
        }
        Ok(introspection) => {
            let (Some(user_id), Some(session_id)) = (introspection.sub, introspection.sid) else {
                return Validation::Invalid { reason: "token_not_active".to_string() };
            };
            Validation::Valid { user_id, session_id, access_token: token.to_string() }
        }
        Err(_) => Validation::Invalid { reason: "token_introspection_failed".to_string() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_header() {
        assert_eq!(parse_bearer("Bearer abc123"), Some("abc123"));
    }

    #[test]
    fn rejects_wrong_scheme() {
        assert_eq!(parse_bearer("Basic abc123"), None);
    }

    #[test]
    fn rejects_missing_token() {
        assert_eq!(parse_bearer("Bearer"), None);
        assert_eq!(parse_bearer("Bearer "), None);
    }

    #[test]
    fn rejects_extra_parts() {
        assert_eq!(parse_bearer("Bearer abc 123"), None);
    }
}
