use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One live broker access token. Replaced wholesale on refresh, never
/// patched in place.
#[derive(Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(access_token: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            access_token,
            issued_at: Utc::now(),
            expires_at,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// True when the token is missing its safety margin before expiry and
    /// must be replaced before use.
    pub fn needs_refresh(&self, margin: Duration) -> bool {
        Utc::now() + margin >= self.expires_at
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at - Utc::now()
    }
}

// Tokens must not leak into logs wholesale.
impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let preview: String = self.access_token.chars().take(8).collect();
        f.debug_struct("AccessToken")
            .field("access_token", &format!("{preview}..."))
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
