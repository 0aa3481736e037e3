use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{Aes256Gcm, AesGcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const LEGACY_IV: &[u8; 16] = b"ThisIsAFixedIV16";

type LegacyCipher = AesGcm<Aes256, U16>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmbedError {
    #[error("malformed embed token")]
    Malformed,
    #[error("embed token rejected")]
    Forbidden,
    #[error("failed to encrypt embed path")]
    Encrypt,
}

#[derive(Clone)]
pub struct EmbedCodec {
    cipher: Aes256Gcm,
    legacy: Option<LegacyCipher>,
}

impl EmbedCodec {
    pub fn new(secret: &str, accept_legacy: bool) -> Self {
        let key = key_from_secret(secret);
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
            legacy: accept_legacy.then(|| LegacyCipher::new(Key::<LegacyCipher>::from_slice(&key))),
        }
    }

    pub fn accepts_legacy(&self) -> bool {
        self.legacy.is_some()
    }

    pub fn encode(&self, path: &str) -> Result<String, EmbedError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), path.as_bytes())
            .map_err(|_| EmbedError::Encrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(URL_SAFE_NO_PAD.encode(out))
    }

    pub fn decode(&self, token: &str) -> Result<String, EmbedError> {
        let current = self.decode_current(token);
        let Some(legacy) = &self.legacy else {
            return current;
        };
        if current.is_ok() {
            return current;
        }
        match decode_legacy(legacy, token) {
            Ok(path) => Ok(path),
            Err(EmbedError::Forbidden) => Err(EmbedError::Forbidden),
            Err(_) => current,
        }
    }

    fn decode_current(&self, token: &str) -> Result<String, EmbedError> {
        let data = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| EmbedError::Malformed)?;
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(EmbedError::Malformed);
        }
        let (nonce, sealed) = data.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| EmbedError::Forbidden)?;
        String::from_utf8(plain).map_err(|_| EmbedError::Malformed)
    }
}

fn decode_legacy(cipher: &LegacyCipher, token: &str) -> Result<String, EmbedError> {
    let data = STANDARD.decode(token).map_err(|_| EmbedError::Malformed)?;
    if data.len() < LEGACY_IV.len() + TAG_LEN {
        return Err(EmbedError::Malformed);
    }
    let (iv, sealed) = data.split_at(LEGACY_IV.len());
    let plain = cipher
        .decrypt(Nonce::<U16>::from_slice(iv), sealed)
        .map_err(|_| EmbedError::Forbidden)?;
    String::from_utf8(plain).map_err(|_| EmbedError::Malformed)
}

/// Secret bytes truncated or zero-padded to the AES-256 key size, so links
/// issued under the same secret keep decoding.
fn key_from_secret(secret: &str) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    let bytes = secret.as_bytes();
    let len = bytes.len().min(KEY_LEN);
    key[..len].copy_from_slice(&bytes[..len]);
    key
}
