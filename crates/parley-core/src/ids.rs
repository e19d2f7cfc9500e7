use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(UserId, "user");
branded_id!(MessageId, "msg");

/// Opaque session token: exactly 32 lowercase hex characters (a uuid-v7 in
/// simple form). The fixed length is part of the contract — callers validate
/// format with [`SessionToken::is_valid_format`] before any registry lookup.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

pub const SESSION_TOKEN_LEN: usize = 32;

impl SessionToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7().simple().to_string())
    }

    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_valid_format(s: &str) -> bool {
        s.len() == SESSION_TOKEN_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionToken {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl AsRef<str> for SessionToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_has_prefix() {
        let id = UserId::new();
        assert!(id.as_str().starts_with("user_"), "got: {id}");
    }

    #[test]
    fn message_id_has_prefix() {
        let id = MessageId::new();
        assert!(id.as_str().starts_with("msg_"), "got: {id}");
    }

    #[test]
    fn ids_are_unique() {
        let a = MessageId::new();
        let b = MessageId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn message_ids_are_monotonic() {
        let ids: Vec<MessageId> = (0..100).map(|_| MessageId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0].as_str() < w[1].as_str(), "not monotonic: {} >= {}", w[0], w[1]);
        }
    }

    #[test]
    fn session_token_is_32_hex_chars() {
        let token = SessionToken::new();
        assert_eq!(token.as_str().len(), SESSION_TOKEN_LEN);
        assert!(token.as_str().bytes().all(|b| b.is_ascii_hexdigit()), "got: {token}");
    }

    #[test]
    fn session_tokens_are_unique() {
        let a = SessionToken::new();
        let b = SessionToken::new();
        assert_ne!(a, b);
    }

    #[test]
    fn valid_format_accepts_generated_tokens() {
        let token = SessionToken::new();
        assert!(SessionToken::is_valid_format(token.as_str()));
    }

    #[test]
    fn valid_format_rejects_wrong_length() {
        assert!(!SessionToken::is_valid_format(""));
        assert!(!SessionToken::is_valid_format("abc123"));
        assert!(!SessionToken::is_valid_format(&"a".repeat(33)));
    }

    #[test]
    fn valid_format_rejects_non_hex() {
        assert!(!SessionToken::is_valid_format(&"z".repeat(32)));
        assert!(!SessionToken::is_valid_format("g123456789abcdef0123456789abcdef"));
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let token = SessionToken::new();
        let s = token.to_string();
        let parsed: SessionToken = s.parse().unwrap();
        assert_eq!(token, parsed);
    }

    #[test]
    fn serde_roundtrip() {
        let id = UserId::new();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn from_raw_preserves_value() {
        let id = UserId::from_raw("custom-id-123");
        assert_eq!(id.as_str(), "custom-id-123");
    }
}
