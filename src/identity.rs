use crate::error::SessionError;
use crate::keys::{random_seed, PublicKey, SecretKey};
use ed25519_dalek::{Signature, SecretKey as Ed25519Seed, Signer, SigningKey, VerifyingKey};
use x25519_dalek::SharedSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Public half of a party's long-term identity.
///
/// Combines the Ed25519 verifying key used for fingerprints and signatures
/// with the X25519 key used during handshake key agreement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityKey {
    signing_key_public: VerifyingKey,
    dh_key_public: PublicKey,
}

impl IdentityKey {
    pub(crate) fn new(signing_key_public: VerifyingKey, dh_key_public: PublicKey) -> Self {
        Self {
            signing_key_public,
            dh_key_public,
        }
    }

    /// Stable textual digest of this identity, used for pinning and
    /// equality checks.
    pub fn fingerprint(&self) -> String {
        hex::encode(self.signing_key_public.as_bytes())
    }

    /// Verifies a signature made by the holder of this identity.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), SessionError> {
        self.signing_key_public
            .verify_strict(message, signature)
            .map_err(|_| SessionError::InvalidSignature)
    }

    /// Returns the public Ed25519 signing key for this identity.
    pub fn signing_key_public(&self) -> &VerifyingKey {
        &self.signing_key_public
    }

    /// Returns the public X25519 key for Diffie-Hellman operations.
    pub fn dh_key_public(&self) -> PublicKey {
        self.dh_key_public
    }
}

/// Long-term identity key pair owned by the local party.
///
/// Holds an Ed25519 signing key for authentication and an X25519 key for
/// Diffie-Hellman key agreement.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: Box<SigningKey>,
    dh_key: SecretKey,
}

impl IdentityKeyPair {
    /// Creates a new identity with randomly generated components.
    pub fn new() -> Result<Self, SessionError> {
        let signing_seed = random_seed()?;
        let signing_key = Box::new(SigningKey::from(Ed25519Seed::from(*signing_seed)));
        let dh_key = SecretKey::from(random_seed()?);

        Ok(Self {
            signing_key,
            dh_key,
        })
    }

    /// Returns the public half of this identity.
    pub fn public_key(&self) -> IdentityKey {
        IdentityKey::new(self.signing_key.verifying_key(), self.dh_key.public_key())
    }

    /// Stable textual digest of this identity.
    pub fn fingerprint(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Signs a message using the Ed25519 signing key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Performs Diffie-Hellman key agreement with another party's
    /// public key.
    pub(crate) fn dh(&self, public_key: &PublicKey) -> SharedSecret {
        self.dh_key.dh(public_key)
    }

    /// Serializes the identity to a 64-byte array.
    ///
    /// The first 32 bytes contain the Ed25519 private key, the last 32
    /// bytes the X25519 private key.
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[0..32].copy_from_slice(self.signing_key.as_bytes().as_slice());
        bytes[32..64].copy_from_slice(&self.dh_key.to_bytes());

        bytes
    }
}

impl From<[u8; 64]> for IdentityKeyPair {
    /// Deserializes an identity key pair from a 64-byte array.
    fn from(bytes: [u8; 64]) -> Self {
        let mut signing_bytes = Box::new([0u8; 32]);
        signing_bytes.copy_from_slice(&bytes[0..32]);
        let signing_key = Box::new(SigningKey::from_bytes(&signing_bytes));
        signing_bytes.zeroize();

        let mut dh_bytes = Box::new([0u8; 32]);
        dh_bytes.copy_from_slice(&bytes[32..64]);
        let dh_key = SecretKey::from(dh_bytes);

        Self {
            signing_key,
            dh_key,
        }
    }
}

impl Zeroize for IdentityKeyPair {
    fn zeroize(&mut self) {
        *self.signing_key = SigningKey::from_bytes(&[0u8; 32]);
        self.dh_key.zeroize();
    }
}

impl ZeroizeOnDrop for IdentityKeyPair {}
