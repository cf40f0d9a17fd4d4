//! Worker join token

use crate::ConfigError;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

/// Token a worker node joins the cluster with.
///
/// Encoded as standard base64 of a JSON object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinToken {
    /// Shared secret sent to the cluster member
    pub secret: String,
    /// Cluster members to contact, in order
    pub join_addresses: Vec<String>,
    /// SHA-256 fingerprint of the cluster member certificate
    pub fingerprint: String,
}

impl JoinToken {
    pub fn decode(encoded: &str) -> Result<Self, ConfigError> {
        let raw = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| ConfigError::InvalidToken(format!("not valid base64: {e}")))?;
        let token: Self = serde_json::from_slice(&raw)
            .map_err(|e| ConfigError::InvalidToken(format!("not a valid token: {e}")))?;

        if token.join_addresses.is_empty() {
            return Err(ConfigError::InvalidToken(
                "empty list of control plane addresses".to_string(),
            ));
        }
        Ok(token)
    }

    pub fn encode(&self) -> Result<String, ConfigError> {
        let raw = serde_json::to_vec(self)?;
        Ok(general_purpose::STANDARD.encode(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> JoinToken {
        JoinToken {
            secret: "s3cr3t".to_string(),
            join_addresses: vec!["10.0.0.1:6400".to_string(), "10.0.0.2:6400".to_string()],
            fingerprint: "ab".repeat(32),
        }
    }

    #[test]
    fn test_decode() {
        let encoded = token().encode().unwrap();
        let decoded = JoinToken::decode(&encoded).unwrap();
        assert_eq!(decoded, token());
        assert_eq!(decoded.join_addresses[0], "10.0.0.1:6400");
    }

    #[test]
    fn test_decode_known_payload() {
        let json = r#"{"secret":"x","join_addresses":["192.168.1.10:6400"],"fingerprint":"ff"}"#;
        let encoded = general_purpose::STANDARD.encode(json);
        let decoded = JoinToken::decode(&encoded).unwrap();
        assert_eq!(decoded.join_addresses, vec!["192.168.1.10:6400".to_string()]);
    }

    #[test]
    fn test_empty_addresses_rejected() {
        let empty = JoinToken {
            join_addresses: vec![],
            ..token()
        };
        let encoded = empty.encode().unwrap();
        assert!(matches!(
            JoinToken::decode(&encoded),
            Err(ConfigError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_malformed_rejected() {
        assert!(matches!(
            JoinToken::decode("%%%"),
            Err(ConfigError::InvalidToken(_))
        ));
        let not_json = general_purpose::STANDARD.encode("hello");
        assert!(matches!(
            JoinToken::decode(&not_json),
            Err(ConfigError::InvalidToken(_))
        ));
    }
}
