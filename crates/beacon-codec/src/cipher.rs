//! Symmetric payload encryption for encrypted channels.
//!
//! # Purpose
//! Implements the cipher seam of the codec pipeline: AES-CBC with PKCS7
//! padding, the IV prepended to the ciphertext so each message is
//! self-contained. Key material never appears in log output.
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::{Error, Result};

pub const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    Aes,
}

impl CipherAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            CipherAlgorithm::Aes => "aes",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Cbc,
}

impl CipherMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CipherMode::Cbc => "cbc",
        }
    }
}

/// Parameters for an encrypted channel.
///
/// The key length selects the AES variant; 128 and 256 bit keys are
/// accepted. A pinned `iv` makes output deterministic and is meant for
/// interoperability tests only.
#[derive(Clone)]
pub struct CipherParams {
    pub algorithm: CipherAlgorithm,
    pub mode: CipherMode,
    key: Vec<u8>,
    iv: Option<[u8; IV_LEN]>,
}

impl CipherParams {
    /// AES-CBC parameters with a random IV per message.
    pub fn aes_cbc(key: Vec<u8>) -> Result<Self> {
        if key.len() != 16 && key.len() != 32 {
            return Err(Error::CipherFailure(format!(
                "unsupported key length {} bytes",
                key.len()
            )));
        }
        Ok(Self {
            algorithm: CipherAlgorithm::Aes,
            mode: CipherMode::Cbc,
            key,
            iv: None,
        })
    }

    /// Pin the IV used for every message.
    pub fn with_iv(mut self, iv: [u8; IV_LEN]) -> Self {
        self.iv = Some(iv);
        self
    }

    pub fn key_length_bits(&self) -> usize {
        self.key.len() * 8
    }

    /// Encoding label for payloads this cipher produced, e.g.
    /// `cipher+aes-128-cbc`.
    pub fn label(&self) -> String {
        format!(
            "cipher+{}-{}-{}",
            self.algorithm.as_str(),
            self.key_length_bits(),
            self.mode.as_str()
        )
    }

    pub fn matches_label(&self, label: &str) -> bool {
        label == self.label()
    }
}

// Key material stays out of Debug output.
impl std::fmt::Debug for CipherParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherParams")
            .field("algorithm", &self.algorithm)
            .field("mode", &self.mode)
            .field("key_length_bits", &self.key_length_bits())
            .field("fixed_iv", &self.iv.is_some())
            .finish()
    }
}

/// Cipher seam consumed by the codec pipeline.
///
/// `encrypt` returns `iv || ciphertext`; `decrypt` expects the same shape.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>>;
}

/// Default AES-CBC/PKCS7 implementation.
pub struct AesCbcCipher {
    params: CipherParams,
}

impl AesCbcCipher {
    pub fn new(params: CipherParams) -> Self {
        Self { params }
    }
}

impl Cipher for AesCbcCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let iv = self.params.iv.unwrap_or_else(|| {
            let mut iv = [0u8; IV_LEN];
            OsRng.fill_bytes(&mut iv);
            iv
        });
        let ciphertext = match self.params.key.len() {
            16 => Aes128CbcEnc::new_from_slices(&self.params.key, &iv)
                .map_err(|err| Error::CipherFailure(err.to_string()))?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            32 => Aes256CbcEnc::new_from_slices(&self.params.key, &iv)
                .map_err(|err| Error::CipherFailure(err.to_string()))?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            other => {
                return Err(Error::CipherFailure(format!(
                    "unsupported key length {other} bytes"
                )));
            }
        };
        let mut payload = Vec::with_capacity(IV_LEN + ciphertext.len());
        payload.extend_from_slice(&iv);
        payload.extend_from_slice(&ciphertext);
        Ok(payload)
    }

    fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() < IV_LEN + BLOCK_LEN || (payload.len() - IV_LEN) % BLOCK_LEN != 0 {
            return Err(Error::CipherFailure(format!(
                "ciphertext length {} is not iv plus whole blocks",
                payload.len()
            )));
        }
        let (iv, ciphertext) = payload.split_at(IV_LEN);
        let plaintext = match self.params.key.len() {
            16 => Aes128CbcDec::new_from_slices(&self.params.key, iv)
                .map_err(|err| Error::CipherFailure(err.to_string()))?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
            32 => Aes256CbcDec::new_from_slices(&self.params.key, iv)
                .map_err(|err| Error::CipherFailure(err.to_string()))?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
            other => {
                return Err(Error::CipherFailure(format!(
                    "unsupported key length {other} bytes"
                )));
            }
        };
        plaintext.map_err(|_| Error::CipherFailure("bad padding".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_odd_key_lengths() {
        let err = CipherParams::aes_cbc(vec![0u8; 20]).expect_err("bad key");
        assert!(matches!(err, Error::CipherFailure(_)));
    }

    #[test]
    fn label_names_algorithm_bits_and_mode() {
        let params = CipherParams::aes_cbc(vec![0u8; 16]).expect("params");
        assert_eq!(params.label(), "cipher+aes-128-cbc");
        let params = CipherParams::aes_cbc(vec![0u8; 32]).expect("params");
        assert_eq!(params.label(), "cipher+aes-256-cbc");
        assert!(params.matches_label("cipher+aes-256-cbc"));
        assert!(!params.matches_label("cipher+aes-128-cbc"));
    }

    #[test]
    fn encrypt_prepends_iv_and_round_trips() {
        let params = CipherParams::aes_cbc(vec![0u8; 16])
            .expect("params")
            .with_iv([7u8; IV_LEN]);
        let cipher = AesCbcCipher::new(params);
        let payload = cipher.encrypt(b"EncryptionTest").expect("encrypt");
        assert_eq!(&payload[..IV_LEN], &[7u8; IV_LEN]);
        assert_eq!(payload.len(), IV_LEN + BLOCK_LEN);
        let plain = cipher.decrypt(&payload).expect("decrypt");
        assert_eq!(plain, b"EncryptionTest");
    }

    #[test]
    fn random_iv_differs_between_messages() {
        let params = CipherParams::aes_cbc(vec![1u8; 32]).expect("params");
        let cipher = AesCbcCipher::new(params);
        let first = cipher.encrypt(b"same").expect("encrypt");
        let second = cipher.encrypt(b"same").expect("encrypt");
        assert_ne!(first, second);
        assert_eq!(cipher.decrypt(&first).expect("decrypt"), b"same");
        assert_eq!(cipher.decrypt(&second).expect("decrypt"), b"same");
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let params = CipherParams::aes_cbc(vec![0u8; 16]).expect("params");
        let cipher = AesCbcCipher::new(params);
        let err = cipher.decrypt(&[0u8; IV_LEN + 3]).expect_err("short");
        assert!(matches!(err, Error::CipherFailure(_)));
    }

    #[test]
    fn twenty_four_byte_key_is_rejected() {
        assert!(CipherParams::aes_cbc(vec![0u8; 24]).is_err());
    }
}
