//! Authenticated symmetric encryption of secret blobs under the master key.
//!
//! Blob layout: `version(1) || nonce(12) || AES-256-GCM ciphertext+tag`.
//! Callers bind each blob to its vault location through the associated data.

use crate::constants;
use crate::error::{Error, Result};
use crate::util::fs as vault_fs;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use std::fs;
use std::path::Path;
use zeroize::{Zeroize, Zeroizing};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
const BLOB_VERSION: u8 = 1;

/// Process-wide vault key. Zeroized on drop.
pub struct MasterKey {
    bytes: Zeroizing<[u8; KEY_SIZE]>,
}

impl MasterKey {
    /// Load the key file. Any problem is fatal: the vault never runs keyless.
    ///
    /// Accepts 32 raw bytes or 64 hex characters (surrounding whitespace ignored).
    pub fn load(path: &Path) -> Result<Self> {
        let fail = |message: String| Error::MasterKey {
            path: path.to_path_buf(),
            message,
        };

        if !path.is_file() {
            return Err(fail("not found (run `fleet-vault init --generate-key`)".into()));
        }
        if let Some(mode) = vault_fs::mode_of(path) {
            if mode & 0o077 != 0 {
                return Err(fail(format!(
                    "permissions {:04o} too open (expected {:04o})",
                    mode,
                    constants::SECRET_FILE_MODE
                )));
            }
        }
        let raw = Zeroizing::new(fs::read(path).map_err(|e| fail(e.to_string()))?);
        Self::from_material(&raw).map_err(fail)
    }

    fn from_material(raw: &[u8]) -> std::result::Result<Self, String> {
        let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
        if raw.len() == KEY_SIZE {
            bytes.copy_from_slice(raw);
            return Ok(Self { bytes });
        }
        let text = std::str::from_utf8(raw)
            .map_err(|_| format!("expected {} raw bytes or {} hex characters", KEY_SIZE, KEY_SIZE * 2))?
            .trim();
        if text.len() != KEY_SIZE * 2 {
            return Err(format!(
                "expected {} raw bytes or {} hex characters, found {} bytes",
                KEY_SIZE,
                KEY_SIZE * 2,
                raw.len()
            ));
        }
        hex::decode_to_slice(text, &mut bytes[..]).map_err(|e| format!("invalid hex: {}", e))?;
        Ok(Self { bytes })
    }

    /// Create a fresh random key file (hex encoded, mode 0600). Never overwrites.
    pub fn generate(path: &Path) -> Result<Self> {
        let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
        OsRng.fill_bytes(bytes.as_mut());
        let mut encoded = Zeroizing::new(hex::encode(&bytes[..]));
        encoded.push('\n');
        vault_fs::write_atomic(path, encoded.as_bytes(), constants::SECRET_FILE_MODE, false)?;
        Ok(Self { bytes })
    }

    #[cfg(test)]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
        }
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// AES-256-GCM codec over the master key.
pub struct SecretCodec {
    cipher: Aes256Gcm,
}

impl SecretCodec {
    pub fn new(key: &MasterKey) -> Self {
        let mut material = *key.bytes;
        let cipher = Aes256Gcm::new(&material.into());
        material.zeroize();
        Self { cipher }
    }

    /// Encrypt `plaintext`, authenticating `aad` alongside it.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|_| Error::Decrypt("encryption failed".into()))?;

        let mut blob = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
        blob.push(BLOB_VERSION);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt a blob. Any tampering, wrong key or wrong `aad` is a `Decrypt` error.
    pub fn decrypt(&self, blob: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if blob.len() < 1 + NONCE_SIZE {
            return Err(Error::Decrypt("blob truncated".into()));
        }
        if blob[0] != BLOB_VERSION {
            return Err(Error::Decrypt(format!("unknown blob version {}", blob[0])));
        }
        let nonce = Nonce::from_slice(&blob[1..1 + NONCE_SIZE]);
        let plaintext = self
            .cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &blob[1 + NONCE_SIZE..],
                    aad,
                },
            )
            .map_err(|_| Error::Decrypt("authentication tag mismatch".into()))?;
        Ok(Zeroizing::new(plaintext))
    }
}

impl std::fmt::Debug for SecretCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretCodec(aes-256-gcm)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn codec(fill: u8) -> SecretCodec {
        SecretCodec::new(&MasterKey::from_bytes([fill; KEY_SIZE]))
    }

    #[test]
    fn test_round_trip_various_plaintexts() {
        let codec = codec(7);
        let long = vec![0xABu8; 10_000];
        let samples: [&[u8]; 5] = [b"", b"x", b"hunter2!", "pässwörd".as_bytes(), &long];
        for plaintext in samples {
            let blob = codec.encrypt(plaintext, b"web01/deploy/v1").unwrap();
            let back = codec.decrypt(&blob, b"web01/deploy/v1").unwrap();
            assert_eq!(back.as_slice(), plaintext);
        }
    }

    #[test]
    fn test_every_bit_flip_detected() {
        let codec = codec(1);
        let blob = codec.encrypt(b"Tr0ub4dor&3", b"").unwrap();
        for byte in 0..blob.len() {
            for bit in 0..8 {
                let mut tampered = blob.clone();
                tampered[byte] ^= 1 << bit;
                let err = codec.decrypt(&tampered, b"").unwrap_err();
                assert!(matches!(err, Error::Decrypt(_)), "byte {} bit {}", byte, bit);
            }
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let blob = codec(1).encrypt(b"secret", b"").unwrap();
        assert!(matches!(codec(2).decrypt(&blob, b""), Err(Error::Decrypt(_))));
    }

    #[test]
    fn test_wrong_aad_fails() {
        let codec = codec(3);
        let blob = codec.encrypt(b"secret", b"web01/deploy/a").unwrap();
        assert!(codec.decrypt(&blob, b"web02/deploy/a").is_err());
    }

    #[test]
    fn test_truncated_blob_fails() {
        let codec = codec(3);
        assert!(matches!(codec.decrypt(&[1, 2, 3], b""), Err(Error::Decrypt(_))));
    }

    #[test]
    fn test_nonces_unique() {
        let codec = codec(4);
        let a = codec.encrypt(b"same", b"").unwrap();
        let b = codec.encrypt(b"same", b"").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_generate_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("master.key");
        let generated = MasterKey::generate(&path).unwrap();
        let loaded = MasterKey::load(&path).unwrap();
        let blob = SecretCodec::new(&generated).encrypt(b"abc", b"").unwrap();
        let back = SecretCodec::new(&loaded).decrypt(&blob, b"").unwrap();
        assert_eq!(back.as_slice(), b"abc");
    }

    #[test]
    fn test_generate_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("master.key");
        MasterKey::generate(&path).unwrap();
        assert!(MasterKey::generate(&path).is_err());
    }

    #[test]
    fn test_missing_key_is_fatal_error() {
        let dir = TempDir::new().unwrap();
        let err = MasterKey::load(&dir.path().join("absent.key")).unwrap_err();
        assert!(matches!(err, Error::MasterKey { .. }));
    }

    #[test]
    fn test_malformed_key_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("master.key");
        vault_fs::write_atomic(&path, b"too short", 0o600, true).unwrap();
        assert!(matches!(MasterKey::load(&path), Err(Error::MasterKey { .. })));
    }

    #[test]
    fn test_signed_hex_pairs_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("master.key");
        vault_fs::write_atomic(&path, "+f".repeat(KEY_SIZE).as_bytes(), 0o600, true).unwrap();
        assert!(matches!(MasterKey::load(&path), Err(Error::MasterKey { .. })));
    }

    #[test]
    fn test_hex_key_file_loads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("master.key");
        let text = format!("{}\n", "0a".repeat(KEY_SIZE));
        vault_fs::write_atomic(&path, text.as_bytes(), 0o600, true).unwrap();
        let loaded = MasterKey::load(&path).unwrap();
        let blob = SecretCodec::new(&MasterKey::from_bytes([0x0a; KEY_SIZE]))
            .encrypt(b"abc", b"")
            .unwrap();
        assert_eq!(SecretCodec::new(&loaded).decrypt(&blob, b"").unwrap().as_slice(), b"abc");
    }

    #[cfg(unix)]
    #[test]
    fn test_world_readable_key_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("master.key");
        MasterKey::generate(&path).unwrap();
        vault_fs::set_permissions(&path, 0o644).unwrap();
        let err = MasterKey::load(&path).unwrap_err();
        assert!(err.to_string().contains("too open"));
    }

    #[test]
    fn test_raw_key_bytes_accepted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("raw.key");
        vault_fs::write_atomic(&path, &[9u8; KEY_SIZE], 0o600, true).unwrap();
        assert!(MasterKey::load(&path).is_ok());
    }
}
