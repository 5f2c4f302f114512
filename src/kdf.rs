//! Key derivation helpers shared by the handshake and the ratchet chains.

use crate::error::SessionError;
use aes_gcm_siv::aead::Aead;
use aes_gcm_siv::{Aes256GcmSiv, KeyInit, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 of `data` under `key`.
pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> Box<[u8; 32]> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC initialization failed");
    mac.update(data);
    let result = mac.finalize().into_bytes();

    let mut out = Box::new([0u8; 32]);
    out.copy_from_slice(&result);
    out
}

/// HKDF-SHA256 expansion of `ikm` under `info`, filling `okm`.
pub(crate) fn hkdf_sha256(salt: Option<&[u8]>, ikm: &[u8], info: &[u8], okm: &mut [u8]) {
    let hkdf = Hkdf::<Sha256>::new(salt, ikm);
    hkdf.expand(info, okm).expect("HKDF expansion failed");
}

/// Authentication key for envelope MACs.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct MacKey(Box<[u8; 32]>);

impl MacKey {
    pub(crate) fn new(key: Box<[u8; 32]>) -> Self {
        Self(key)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Computes the MAC over `data`.
    pub(crate) fn sign(&self, data: &[u8]) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(hmac_sha256(self.0.as_slice(), data).as_slice());
        out
    }

    /// Verifies `tag` against `data` in constant time.
    pub(crate) fn verify(&self, tag: &[u8], data: &[u8]) -> bool {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.0.as_slice())
            .expect("HMAC initialization failed");
        mac.update(data);
        mac.verify_slice(tag).is_ok()
    }
}

/// Symmetric key for payload encryption, paired with its derived nonce.
///
/// The nonce is derived together with the key and each pair is used for at
/// most one message.
#[derive(Clone)]
pub(crate) struct CipherKey {
    key: Box<[u8; 32]>,
    nonce: Box<[u8; 12]>,
}

impl CipherKey {
    pub(crate) fn new(key: Box<[u8; 32]>, nonce: Box<[u8; 12]>) -> Self {
        Self { key, nonce }
    }

    pub(crate) fn key_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    pub(crate) fn nonce_bytes(&self) -> &[u8; 12] {
        &self.nonce
    }

    pub(crate) fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let key = aes_gcm_siv::Key::<Aes256GcmSiv>::from_slice(self.key.as_slice());
        let cipher = Aes256GcmSiv::new(key);
        let nonce = Nonce::from_slice(self.nonce.as_slice());

        cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| SessionError::Crypto("message encryption failed"))
    }

    pub(crate) fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let key = aes_gcm_siv::Key::<Aes256GcmSiv>::from_slice(self.key.as_slice());
        let cipher = Aes256GcmSiv::new(key);
        let nonce = Nonce::from_slice(self.nonce.as_slice());

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| SessionError::InvalidMessage("message decryption failed"))
    }
}

impl Zeroize for CipherKey {
    fn zeroize(&mut self) {
        self.key.zeroize();
        self.nonce.zeroize();
    }
}

impl ZeroizeOnDrop for CipherKey {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_sign_verify() {
        let key = MacKey::new(Box::new([7u8; 32]));
        let tag = key.sign(b"payload");

        assert!(key.verify(&tag, b"payload"));
        assert!(!key.verify(&tag, b"other payload"));

        let other = MacKey::new(Box::new([8u8; 32]));
        assert!(!other.verify(&tag, b"payload"));
    }

    #[test]
    fn test_cipher_key_round_trip() {
        let key = CipherKey::new(Box::new([3u8; 32]), Box::new([9u8; 12]));

        let ciphertext = key.encrypt(b"secret").unwrap();
        assert_ne!(ciphertext.as_slice(), b"secret");

        let plaintext = key.decrypt(&ciphertext).unwrap();
        assert_eq!(plaintext, b"secret");
    }

    #[test]
    fn test_cipher_key_rejects_tampering() {
        let key = CipherKey::new(Box::new([3u8; 32]), Box::new([9u8; 12]));

        let mut ciphertext = key.encrypt(b"secret").unwrap();
        ciphertext[0] ^= 0x01;

        assert!(key.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_hkdf_is_deterministic() {
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        hkdf_sha256(None, b"input", b"Test-Info", &mut a);
        hkdf_sha256(None, b"input", b"Test-Info", &mut b);
        assert_eq!(a, b);

        let mut c = [0u8; 64];
        hkdf_sha256(None, b"input", b"Other-Info", &mut c);
        assert_ne!(a, c);
    }
}
