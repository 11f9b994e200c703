//! Streaming authentication: the auth endpoint hands out a short-lived JWT
//! whose capability claim lists the channels this SDK key may subscribe to.
use base64::Engine;
use serde::Deserialize;

use crate::{Error, Result};

/// Response of the `v2/auth` endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub push_enabled: bool,
    #[serde(default)]
    pub token: Option<String>,
}

/// A parsed streaming token.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub push_enabled: bool,
    /// The raw JWT, passed through to the streaming endpoint.
    pub token: String,
    /// Channels this token may subscribe to.
    pub channels: Vec<String>,
    /// Expiry, epoch seconds.
    pub exp: i64,
    /// Issued-at, epoch seconds.
    pub iat: i64,
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[serde(rename = "x-ably-capability")]
    capability: String,
    exp: i64,
    iat: i64,
}

impl Token {
    /// Decode the channel list and validity window from the JWT payload.
    /// The signature is not verified; the token is only forwarded to the
    /// streaming endpoint, which does.
    pub fn parse(push_enabled: bool, raw: &str) -> Result<Token> {
        let payload = raw.split('.').nth(1).ok_or(Error::MalformedToken)?;
        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|_| Error::MalformedToken)?;
        let claims: TokenClaims =
            serde_json::from_slice(&decoded).map_err(|_| Error::MalformedToken)?;
        let capability: std::collections::HashMap<String, serde_json::Value> =
            serde_json::from_str(&claims.capability).map_err(|_| Error::MalformedToken)?;

        let mut channels: Vec<String> = capability.into_keys().collect();
        channels.sort();

        Ok(Token {
            push_enabled,
            token: raw.to_owned(),
            channels,
            exp: claims.exp,
            iat: claims.iat,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_jwt(claims: &serde_json::Value) -> String {
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(claims).unwrap());
        format!("header.{payload}.signature")
    }

    #[test]
    fn parses_channels_and_expiry_from_the_capability_claim() {
        let raw = encode_jwt(&serde_json::json!({
            "x-ably-capability": "{\"MzM5Ng==_MTExMw==_segments\":[\"subscribe\"],\
                \"MzM5Ng==_MTExMw==_splits\":[\"subscribe\"],\
                \"control_pri\":[\"subscribe\",\"channel-metadata:publishers\"],\
                \"control_sec\":[\"subscribe\",\"channel-metadata:publishers\"]}",
            "exp": 1675449000,
            "iat": 1675445400,
        }));

        let token = Token::parse(true, &raw).unwrap();
        assert!(token.push_enabled);
        assert_eq!(token.exp, 1675449000);
        assert_eq!(token.iat, 1675445400);
        assert_eq!(token.channels.len(), 4);
        assert!(token.channels.iter().any(|c| c.ends_with("_splits")));
        assert!(token.channels.contains(&"control_pri".to_owned()));
    }

    #[test]
    fn rejects_garbage_tokens() {
        assert!(matches!(
            Token::parse(true, "not-a-jwt"),
            Err(Error::MalformedToken)
        ));
        assert!(matches!(
            Token::parse(true, "a.!!!.c"),
            Err(Error::MalformedToken)
        ));
    }
}
