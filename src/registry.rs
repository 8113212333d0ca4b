//! Session registry: what each in-flight connection has told us so far.
//!
//! Authentication callbacks append offered keys under the registry lock;
//! the banner task snapshots the record once; teardown removes it. Values
//! are copied out so the lock is never held anywhere near I/O.

use std::collections::HashMap;
use std::sync::Mutex;

use russh::keys::PublicKey;

/// Correlates auth callbacks with their connection handler.
pub type SessionId = [u8; 32];

/// A public key as the client offered it, in authorized-keys form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedKey {
    line: String,
}

impl OfferedKey {
    pub fn new(key: &PublicKey) -> Self {
        Self {
            line: authorized_key_line(key),
        }
    }

    /// The `<algorithm> <base64>` line.
    pub fn line(&self) -> &str {
        &self.line
    }

    /// Build from a raw authorized-keys line without a key object.
    #[cfg(test)]
    pub(crate) fn from_line(line: &str) -> Self {
        Self {
            line: line.to_string(),
        }
    }
}

/// Serialize a public key to the single-line OpenSSH authorized-keys form.
pub fn authorized_key_line(key: &PublicKey) -> String {
    use russh::keys::PublicKeyBase64;

    let algorithm = match key.algorithm() {
        russh::keys::Algorithm::Ed25519 => "ssh-ed25519".to_string(),
        russh::keys::Algorithm::Rsa { .. } => "ssh-rsa".to_string(),
        russh::keys::Algorithm::Ecdsa { curve } => match curve {
            russh::keys::EcdsaCurve::NistP256 => "ecdsa-sha2-nistp256".to_string(),
            russh::keys::EcdsaCurve::NistP384 => "ecdsa-sha2-nistp384".to_string(),
            russh::keys::EcdsaCurve::NistP521 => "ecdsa-sha2-nistp521".to_string(),
        },
        other => other.to_string(),
    };

    format!("{} {}", algorithm, key.public_key_base64())
}

/// Username the client claimed plus every key it offered, in offer order.
///
/// Keys are not deduplicated; a client that offers the same key twice is
/// recorded twice.
#[derive(Debug, Clone, Default)]
pub struct SessionRecord {
    pub claimed_username: String,
    pub keys_offered: Vec<OfferedKey>,
}

/// Process-wide map from session id to session record.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionRecord>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an offered key, creating the record on first use.
    pub fn append_key(&self, id: &SessionId, username: &str, key: OfferedKey) {
        let mut sessions = self.sessions.lock().unwrap();
        let record = sessions.entry(*id).or_default();
        record.claimed_username = username.to_string();
        record.keys_offered.push(key);
    }

    /// Snapshot the record for a session. The caller owns the copy and
    /// needs no further locking.
    pub fn take(&self, id: &SessionId) -> Option<SessionRecord> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    /// Remove and return the record at teardown.
    pub fn remove(&self, id: &SessionId) -> Option<SessionRecord> {
        self.sessions.lock().unwrap().remove(id)
    }

    /// Number of live session records.
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
