use aes::Aes256;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use cbc::{Decryptor, Encryptor};
use cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

use crate::RoomKey;

type Aes256CbcEnc = Encryptor<Aes256>;
type Aes256CbcDec = Decryptor<Aes256>;

/// Fixed PBKDF2 iteration count. Part of the wire compatibility contract:
/// changing it orphans every previously stored message.
pub const PBKDF2_ITERATIONS: u32 = 10_000;

/// Display string substituted for any message body that fails to decrypt
/// (wrong PIN, corrupted payload). Rendering must never crash on bad
/// ciphertext, so this is returned instead of an error.
pub const DECRYPT_SENTINEL: &str = "[unable to decrypt]";

const IV_LEN: usize = 16;
const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("invalid IV encoding: {0}")]
    BadIv(#[from] hex::FromHexError),
    #[error("IV must be {IV_LEN} bytes, got {0}")]
    BadIvLength(usize),
    #[error("invalid ciphertext encoding: {0}")]
    BadCiphertext(#[from] base64::DecodeError),
    #[error("cipher operation failed during unpadding")]
    Unpad,
    #[error("decrypted payload is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Derives the 256-bit room key from the PIN, salted with the RoomKey.
/// Pure and deterministic: same inputs always produce the same key.
pub fn derive_key(pin: &str, room_key: &RoomKey) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(
        pin.as_bytes(),
        room_key.as_bytes(),
        PBKDF2_ITERATIONS,
        &mut key,
    );
    key
}

/// Per-room symmetric cipher. Derives the key once and holds it in
/// memory only; the key is never persisted or logged.
pub struct RoomCipher {
    key: [u8; KEY_LEN],
}

impl RoomCipher {
    pub fn new(pin: &str, room_key: &RoomKey) -> Self {
        Self {
            key: derive_key(pin, room_key),
        }
    }

    /// Seals a message body as `hex(iv):base64(ciphertext)`.
    ///
    /// A fresh random IV is drawn per call, so identical plaintext never
    /// produces identical ciphertext. Empty plaintext maps to an empty
    /// envelope (no-op).
    pub fn encrypt(&self, plaintext: &str) -> String {
        if plaintext.is_empty() {
            return String::new();
        }
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let ciphertext = Aes256CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        format!("{}:{}", hex::encode(iv), BASE64.encode(ciphertext))
    }

    /// Opens an envelope. Never fails:
    /// - `iv:ciphertext` inputs that do not decrypt (wrong PIN, corrupt
    ///   data) come back as [`DECRYPT_SENTINEL`];
    /// - inputs without a `:` separator are legacy plain-base64 bodies
    ///   from pre-encryption history, decoded without any key;
    /// - anything else is returned unchanged.
    pub fn decrypt(&self, input: &str) -> String {
        if input.is_empty() {
            return String::new();
        }
        match input.split_once(':') {
            Some((iv_hex, ciphertext_b64)) => self
                .try_decrypt(iv_hex, ciphertext_b64)
                .unwrap_or_else(|_| DECRYPT_SENTINEL.to_string()),
            None => decode_legacy(input),
        }
    }

    fn try_decrypt(&self, iv_hex: &str, ciphertext_b64: &str) -> Result<String, CipherError> {
        let iv: [u8; IV_LEN] = hex::decode(iv_hex)?
            .try_into()
            .map_err(|bad: Vec<u8>| CipherError::BadIvLength(bad.len()))?;
        let mut buf = BASE64.decode(ciphertext_b64)?;
        let plaintext = Aes256CbcDec::new(&self.key.into(), &iv.into())
            .decrypt_padded_mut::<Pkcs7>(&mut buf)
            .map_err(|_| CipherError::Unpad)?;
        Ok(String::from_utf8(plaintext.to_vec())?)
    }
}

impl std::fmt::Debug for RoomCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.write_str("RoomCipher{..}")
    }
}

fn decode_legacy(input: &str) -> String {
    BASE64
        .decode(input)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| input.to_string())
}
