/// Session storage backed by the OS credential store
///
/// - macOS/iOS: Keychain
/// - Linux: Secret Service API (gnome-keyring, KWallet, etc.)
/// - Windows: Credential Manager
use keyring::Entry;

use crate::auth::{AuthError, Session, SessionStore};
use crate::constants::KEYRING_SERVICE;

#[derive(Debug, thiserror::Error)]
pub enum SecureStorageError {
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Stored session is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl From<SecureStorageError> for AuthError {
    fn from(e: SecureStorageError) -> Self {
        AuthError::Storage(e.to_string())
    }
}

/// One keyring entry per account, holding the session as JSON
pub struct KeyringSessionStore {
    account: String,
}

impl KeyringSessionStore {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
        }
    }

    fn entry(&self) -> Result<Entry, SecureStorageError> {
        Ok(Entry::new(KEYRING_SERVICE, &self.account)?)
    }

    fn read(&self) -> Result<Option<Session>, SecureStorageError> {
        match self.entry()?.get_password() {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, session: &Session) -> Result<(), SecureStorageError> {
        let json = serde_json::to_string(session)?;
        self.entry()?.set_password(&json)?;
        Ok(())
    }

    fn delete(&self) -> Result<(), SecureStorageError> {
        match self.entry()?.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()), // Already deleted is success
            Err(e) => Err(e.into()),
        }
    }
}

impl SessionStore for KeyringSessionStore {
    fn load(&self) -> Result<Option<Session>, AuthError> {
        Ok(self.read()?)
    }

    fn save(&self, session: &Session) -> Result<(), AuthError> {
        Ok(self.write(session)?)
    }

    fn clear(&self) -> Result<(), AuthError> {
        Ok(self.delete()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_map_to_storage() {
        let malformed = serde_json::from_str::<Session>("{").unwrap_err();
        let err: AuthError = SecureStorageError::Malformed(malformed).into();
        assert!(matches!(err, AuthError::Storage(msg) if msg.contains("malformed")));
    }
}
