use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Opaque room identifier derived from a (name, PIN) pair.
///
/// Used both as the database partition key and as the key-derivation
/// salt, so the derivation must stay bit-for-bit stable:
/// `lowercase(trim(name)) + "_" + trim(pin)`.
///
/// Different PINs for the same room name intentionally yield different
/// rooms (and therefore different encryption keys); that is the access
/// control model, not a collision bug.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomKey(String);

impl RoomKey {
    pub fn derive(name: &str, pin: &str) -> Self {
        Self(format!("{}_{}", name.trim().to_lowercase(), pin.trim()))
    }

    /// Wrap an already-derived key (e.g. read back from storage).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Display for RoomKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
