//! Next-page marker cipher.
//!
//! Markers are `base64url(nonce || AES-256-GCM(cursor))` without padding. The default key
//! only keeps clients from reading or forging backend cursors by accident; it is built
//! into the binary and is not a secret.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use o2ims_core::{O2Error, O2Result};
use rand::Rng;

pub const NONCE_SIZE: usize = 12;
pub const KEY_SIZE: usize = 32;

pub const DEFAULT_MARKER_KEY: [u8; KEY_SIZE] = [
    0x44, 0x48, 0xb5, 0x2c, 0xa5, 0x11, 0x4e, 0xea, 0x7e, 0x37, 0xcf, 0x85, 0x34, 0x5b, 0x5f, 0xd7,
    0x04, 0xc7, 0x37, 0x3a, 0x5b, 0x9f, 0x49, 0x63, 0x54, 0xa9, 0xb0, 0xbd, 0x2d, 0x5e, 0xcc, 0x37,
];

#[derive(Clone)]
pub struct MarkerCipher {
    cipher: Aes256Gcm,
    /// Pinned nonce, only for deterministic output in tests.
    nonce: Option<[u8; NONCE_SIZE]>,
}

impl MarkerCipher {
    pub fn new(key: &[u8], nonce: Option<&[u8]>) -> O2Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| {
            O2Error::Validation(format!("next page marker key is {} bytes long, but the cipher requires {}", key.len(), KEY_SIZE))
        })?;
        let nonce = nonce
            .map(|n| {
                <[u8; NONCE_SIZE]>::try_from(n).map_err(|_| {
                    O2Error::Validation(format!(
                        "nonce has been explicitly specified, and it is {} bytes long, but the cipher requires {}",
                        n.len(), NONCE_SIZE
                    ))
                })
            })
            .transpose()?;
        Ok(Self { cipher, nonce })
    }

    pub fn encrypt(&self, cursor: &[u8]) -> O2Result<String> {
        let nonce = match self.nonce {
            Some(n) => n,
            None => {
                let mut n = [0u8; NONCE_SIZE];
                OsRng.fill(&mut n);
                n
            }
        };
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), cursor)
            .map_err(|_| O2Error::internal("failed to seal next page marker"))?;
        let mut data = Vec::with_capacity(NONCE_SIZE + sealed.len());
        data.extend_from_slice(&nonce);
        data.extend_from_slice(&sealed);
        Ok(URL_SAFE_NO_PAD.encode(data))
    }

    /// Any malformed, truncated or tampered marker is a `Validation` error.
    pub fn decrypt(&self, text: &str) -> O2Result<Vec<u8>> {
        let data = URL_SAFE_NO_PAD
            .decode(text)
            .map_err(|e| O2Error::Validation(format!("marker isn't valid base64: {}", e)))?;
        if data.len() < NONCE_SIZE {
            return Err(O2Error::Validation(format!(
                "marker size ({} bytes) is smaller than nonce size ({} bytes)", data.len(), NONCE_SIZE
            )));
        }
        let (nonce, sealed) = data.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| O2Error::validation("marker failed authentication"))
    }
}

impl Default for MarkerCipher {
    fn default() -> Self {
        Self { cipher: Aes256Gcm::new(&DEFAULT_MARKER_KEY.into()), nonce: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_nonce_is_deterministic_and_opens() {
        let c = MarkerCipher::new(&DEFAULT_MARKER_KEY, Some(&[7u8; NONCE_SIZE])).unwrap();
        let a = c.encrypt(b"page=2").unwrap();
        assert_eq!(a, c.encrypt(b"page=2").unwrap());
        assert!(!a.contains('=') && !a.contains('+') && !a.contains('/'));
        assert_eq!(c.decrypt(&a).unwrap(), b"page=2");
        assert_eq!(c.decrypt(&c.encrypt(b"").unwrap()).unwrap(), b"");
    }

    #[test]
    fn random_nonces_differ() {
        let c = MarkerCipher::default();
        let a = c.encrypt(b"x").unwrap();
        let b = c.encrypt(b"x").unwrap();
        assert_ne!(a, b);
        assert_eq!(c.decrypt(&b).unwrap(), b"x");
    }

    #[test]
    fn bad_markers_are_validation_errors() {
        let c = MarkerCipher::default();
        for text in ["***", "AAAA", ""] {
            assert!(matches!(c.decrypt(text), Err(O2Error::Validation(_))), "{}", text);
        }
        let mut good = c.encrypt(b"cursor").unwrap().into_bytes();
        let last = good.len() - 1;
        good[last] = if good[last] == b'A' { b'B' } else { b'A' };
        assert!(c.decrypt(std::str::from_utf8(&good).unwrap()).is_err());
        let other = MarkerCipher::new(&[1u8; KEY_SIZE], None).unwrap();
        assert!(other.decrypt(&c.encrypt(b"cursor").unwrap()).is_err());
    }

    #[test]
    fn key_and_nonce_sizes_are_checked() {
        assert!(MarkerCipher::new(&[0u8; 16], None).is_err());
        assert!(MarkerCipher::new(&DEFAULT_MARKER_KEY, Some(&[0u8; 8])).is_err());
    }
}
