use std::collections::HashMap;

use chrono::{DateTime, Utc};
use secrecy::SecretString;

use crate::errors::PersistenceError;

/// Wraps an API key with secrecy protection (zeroized on drop, redacted in Debug).
#[derive(Clone)]
pub struct ApiKey(pub SecretString);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(SecretString::from(key.into()))
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}

/// One credential/model pair in the rotation list.
#[derive(Clone, Debug)]
pub struct CredentialSlot {
    /// Stable id used to persist cooldowns across restarts.
    pub id: String,
    pub credential: ApiKey,
    pub model: String,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl CredentialSlot {
    pub fn new(id: impl Into<String>, credential: ApiKey, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            credential,
            model: model.into(),
            cooldown_until: None,
        }
    }

    pub fn is_cooling(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }
}

/// Durable cooldown state, keyed by slot id.
pub trait CooldownStore: Send + Sync {
    fn load_cooldowns(&self) -> Result<HashMap<String, DateTime<Utc>>, PersistenceError>;
    fn save_cooldown(&self, slot_id: &str, until: DateTime<Utc>) -> Result<(), PersistenceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use secrecy::ExposeSecret;

    #[test]
    fn api_key_debug_redacted() {
        let key = ApiKey::new("AIza-12345");
        let debug = format!("{:?}", key);
        assert!(!debug.contains("AIza"), "key leaked in debug: {debug}");
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn slot_debug_does_not_leak_key() {
        let slot = CredentialSlot::new("k0", ApiKey::new("secret-value"), "gemini-2.0-flash");
        let debug = format!("{:?}", slot);
        assert!(!debug.contains("secret-value"));
        assert!(debug.contains("gemini-2.0-flash"));
    }

    #[test]
    fn api_key_expose_secret() {
        let key = ApiKey::new("AIza-12345");
        assert_eq!(key.0.expose_secret(), "AIza-12345");
    }

    #[test]
    fn cooling_window() {
        let now = Utc::now();
        let mut slot = CredentialSlot::new("k0", ApiKey::new("x"), "m");
        assert!(!slot.is_cooling(now));
        slot.cooldown_until = Some(now + Duration::seconds(30));
        assert!(slot.is_cooling(now));
        assert!(!slot.is_cooling(now + Duration::seconds(31)));
    }
}
