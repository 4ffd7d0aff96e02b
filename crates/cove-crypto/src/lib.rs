//! Message confidentiality for Cove rooms.
//!
//! A room is identified by a (name, PIN) pair. The pair deterministically
//! yields a [`RoomKey`] that doubles as the storage partition key and the
//! KDF salt, and a [`RoomCipher`] that seals message bodies end-to-end
//! relative to the store. The envelope format (`hex-iv:base64-ciphertext`)
//! is persisted verbatim and must stay stable.

mod cipher;
mod room;

pub use cipher::{derive_key, CipherError, RoomCipher, DECRYPT_SENTINEL, PBKDF2_ITERATIONS};
pub use room::RoomKey;
