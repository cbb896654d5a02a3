use std::fmt;

use sha2::{Digest, Sha256};

/// Digest of a room password, salted with the room id so equal passwords
/// in different rooms never share a digest.
#[derive(Clone, PartialEq, Eq)]
pub struct RoomSecret([u8; 32]);

impl RoomSecret {
    pub fn derive(room_id: &str, password: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(room_id.as_bytes());
        hasher.update(b":");
        hasher.update(password.as_bytes());

        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize());
        Self(digest)
    }

    pub fn matches(&self, room_id: &str, candidate: Option<&str>) -> bool {
        candidate.is_some_and(|password| Self::derive(room_id, password) == *self)
    }
}

impl fmt::Debug for RoomSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RoomSecret(..)")
    }
}
