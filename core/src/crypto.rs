use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::path::Path;

pub const IV_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
pub const TAG_LEN: usize = 16;
pub const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const SUBKEY_INFO: &[u8] = b"cipherset|segment-key|v1";

/// Version byte bound into every sealed segment.
pub(crate) const SEGMENT_FORMAT: u8 = 1;

/// Symmetric key and IV shared by every file of a backup set.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    iv: [u8; IV_LEN],
    key: [u8; KEY_LEN],
}

/// On-disk shape of a key file. Compact names are written, long names accepted.
#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    #[serde(rename = "A", alias = "iv", default, skip_serializing_if = "Option::is_none")]
    iv: Option<String>,
    #[serde(rename = "B", alias = "key", default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
}

impl KeyMaterial {
    /// Draws a fresh IV and key from the operating system's random source.
    pub fn generate() -> Result<Self> {
        let mut iv = [0u8; IV_LEN];
        let mut key = [0u8; KEY_LEN];
        OsRng
            .try_fill_bytes(&mut iv)
            .and_then(|_| OsRng.try_fill_bytes(&mut key))
            .map_err(|e| Error::CryptoUnavailable(e.to_string()))?;
        Ok(Self { iv, key })
    }

    pub fn from_parts(iv: [u8; IV_LEN], key: [u8; KEY_LEN]) -> Self {
        Self { iv, key }
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    pub fn encode(&self) -> Result<String> {
        let file = KeyFile {
            iv: Some(STANDARD.encode(self.iv)),
            key: Some(STANDARD.encode(self.key)),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        let file: KeyFile =
            serde_json::from_str(text).map_err(|e| Error::MalformedKeyData(e.to_string()))?;
        let iv = decode_field("A (iv)", file.iv.as_deref())?;
        let key = decode_field("B (key)", file.key.as_deref())?;
        Ok(Self { iv, key })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Cannot read key file {}: {}", path.display(), e))
        })?;
        Self::decode(&text)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.encode()?)?;
        Ok(())
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial").finish_non_exhaustive()
    }
}

fn decode_field<const N: usize>(name: &str, value: Option<&str>) -> Result<[u8; N]> {
    let value = value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::MalformedKeyData(format!("missing field {}", name)))?;
    let bytes = STANDARD
        .decode(value)
        .map_err(|e| Error::MalformedKeyData(format!("field {}: {}", name, e)))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        Error::MalformedKeyData(format!(
            "field {} must decode to {} bytes, got {}",
            name,
            N,
            b.len()
        ))
    })
}

/// Fresh random salt for one sealed stream.
pub fn stream_salt() -> Result<[u8; SALT_LEN]> {
    let mut salt = [0u8; SALT_LEN];
    OsRng
        .try_fill_bytes(&mut salt)
        .map_err(|e| Error::CryptoUnavailable(e.to_string()))?;
    Ok(salt)
}

/// Seals and opens the fixed-size segments of one sealed stream.
///
/// The set key is never used directly: every stream carries its own random
/// salt and its segments are sealed under HKDF-SHA256(salt, key). Segment `n`
/// uses the first 12 IV bytes with the low 8 bytes XORed by `n`, which is
/// unique per stream because the subkey is.
///
/// The associated data carries the format byte and a final-segment flag, so
/// reordered or truncated streams fail authentication.
pub struct Encryptor {
    cipher: ChaCha20Poly1305,
    iv: [u8; IV_LEN],
}

impl Encryptor {
    pub fn new(key: &KeyMaterial, salt: &[u8; SALT_LEN]) -> Result<Self> {
        if salt.iter().all(|&b| b == 0) {
            return Err(Error::CryptoFailure("stream salt must not be all zero".to_string()));
        }
        let mut subkey = [0u8; KEY_LEN];
        Hkdf::<Sha256>::new(Some(salt), key.key())
            .expand(SUBKEY_INFO, &mut subkey)
            .map_err(|_| Error::CryptoFailure("HKDF expand failed".to_string()))?;
        let cipher = ChaCha20Poly1305::new_from_slice(&subkey)
            .map_err(|e| Error::CryptoFailure(e.to_string()))?;
        Ok(Self { cipher, iv: key.iv })
    }

    fn nonce(&self, index: u64) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&self.iv[..NONCE_LEN]);
        for (slot, b) in nonce[4..].iter_mut().zip(index.to_le_bytes()) {
            *slot ^= b;
        }
        nonce
    }

    pub fn seal_segment(&self, index: u64, last: bool, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.nonce(index);
        let aad = [SEGMENT_FORMAT, last as u8];
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: &aad })
            .map_err(|e| Error::CryptoFailure(format!("segment {}: {}", index, e)))
    }

    pub fn open_segment(&self, index: u64, last: bool, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_LEN {
            return Err(Error::CryptoFailure(format!("segment {} too short", index)));
        }
        let nonce = self.nonce(index);
        let aad = [SEGMENT_FORMAT, last as u8];
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad: &aad })
            .map_err(|_| {
                Error::CryptoFailure(format!(
                    "segment {} failed authentication (wrong key or corrupted data)",
                    index
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_roundtrip() {
        let key = KeyMaterial::generate().unwrap();
        let encryptor = Encryptor::new(&key, &stream_salt().unwrap()).unwrap();

        let sealed = encryptor.seal_segment(3, false, b"Hello, backup set!").unwrap();
        assert_eq!(sealed.len(), 18 + TAG_LEN);
        let opened = encryptor.open_segment(3, false, &sealed).unwrap();
        assert_eq!(opened, b"Hello, backup set!");
    }

    #[test]
    fn test_segment_position_is_authenticated() {
        let key = KeyMaterial::generate().unwrap();
        let encryptor = Encryptor::new(&key, &stream_salt().unwrap()).unwrap();

        let sealed = encryptor.seal_segment(0, false, b"payload").unwrap();
        assert!(encryptor.open_segment(1, false, &sealed).is_err());
        assert!(encryptor.open_segment(0, true, &sealed).is_err());
    }

    #[test]
    fn test_streams_under_one_key_never_share_keystream() {
        let key = KeyMaterial::generate().unwrap();
        let first = Encryptor::new(&key, &stream_salt().unwrap()).unwrap();
        let second = Encryptor::new(&key, &stream_salt().unwrap()).unwrap();

        let p1 = [0x11u8; 64];
        let p2 = [0x5au8; 64];
        let c1 = first.seal_segment(0, true, &p1).unwrap();
        let c2 = second.seal_segment(0, true, &p2).unwrap();

        let cipher_xor: Vec<u8> = c1.iter().zip(&c2).take(64).map(|(a, b)| a ^ b).collect();
        let plain_xor: Vec<u8> = p1.iter().zip(&p2).map(|(a, b)| a ^ b).collect();
        assert_ne!(cipher_xor, plain_xor);

        // Same plaintext, different streams: unrelated ciphertexts and tags.
        assert_ne!(
            first.seal_segment(0, true, &p1).unwrap(),
            second.seal_segment(0, true, &p1).unwrap()
        );
        assert!(second.open_segment(0, true, &c1).is_err());
    }

    #[test]
    fn test_zero_salt_rejected() {
        let key = KeyMaterial::generate().unwrap();
        assert!(matches!(
            Encryptor::new(&key, &[0u8; SALT_LEN]),
            Err(Error::CryptoFailure(_))
        ));
    }

    #[test]
    fn test_key_encoding_roundtrip() {
        let key = KeyMaterial::generate().unwrap();
        let text = key.encode().unwrap();
        assert!(text.contains("\"A\""));
        assert!(text.contains("\"B\""));
        assert_eq!(KeyMaterial::decode(&text).unwrap(), key);
    }

    #[test]
    fn test_long_field_names_accepted() {
        let iv = STANDARD.encode([7u8; IV_LEN]);
        let key = STANDARD.encode([9u8; KEY_LEN]);
        let text = format!(r#"{{"iv": "{}", "key": "{}"}}"#, iv, key);
        let decoded = KeyMaterial::decode(&text).unwrap();
        assert_eq!(decoded.iv(), &[7u8; IV_LEN]);
        assert_eq!(decoded.key(), &[9u8; KEY_LEN]);
    }

    #[test]
    fn test_malformed_key_data() {
        assert!(matches!(
            KeyMaterial::decode(r#"{"A": "AAAA"}"#),
            Err(Error::MalformedKeyData(_))
        ));
        assert!(matches!(
            KeyMaterial::decode(r#"{"A": "", "B": ""}"#),
            Err(Error::MalformedKeyData(_))
        ));
        assert!(matches!(
            KeyMaterial::decode(r#"{"A": "AAAA", "B": "AAAA"}"#),
            Err(Error::MalformedKeyData(_))
        ));
        assert!(matches!(
            KeyMaterial::decode("not json"),
            Err(Error::MalformedKeyData(_))
        ));
    }

    #[test]
    fn test_debug_hides_key_bytes() {
        let key = KeyMaterial::from_parts([1; IV_LEN], [2; KEY_LEN]);
        let shown = format!("{:?}", key);
        assert!(!shown.contains('2'));
    }
}
