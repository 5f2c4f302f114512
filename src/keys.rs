use crate::error::SessionError;
use rand::rngs::OsRng;
use rand::TryRngCore;
use x25519_dalek::{PublicKey as X25519Public, SharedSecret, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Fills a boxed byte array from the operating system's secure source.
pub(crate) fn random_bytes<const N: usize>() -> Result<Box<[u8; N]>, SessionError> {
    let mut bytes = Box::new([0u8; N]);
    OsRng
        .try_fill_bytes(bytes.as_mut_slice())
        .map_err(|_| SessionError::Random)?;
    Ok(bytes)
}

/// Generates a cryptographically secure random 32-byte seed.
pub(crate) fn random_seed() -> Result<Box<[u8; 32]>, SessionError> {
    random_bytes::<32>()
}

/// Public half of an X25519 key pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(X25519Public);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

impl From<[u8; 32]> for PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(X25519Public::from(bytes))
    }
}

impl From<X25519Public> for PublicKey {
    fn from(value: X25519Public) -> Self {
        Self(value)
    }
}

impl AsRef<X25519Public> for PublicKey {
    fn as_ref(&self) -> &X25519Public {
        &self.0
    }
}

/// Secret half of an X25519 key pair.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(Box<StaticSecret>);

impl SecretKey {
    /// Performs Diffie-Hellman key agreement with the other party's
    /// public key.
    pub(crate) fn dh(&self, public_key: &PublicKey) -> SharedSecret {
        self.0.diffie_hellman(public_key.as_ref())
    }

    pub(crate) fn public_key(&self) -> PublicKey {
        let pub_key = X25519Public::from(self.0.as_ref());
        pub_key.into()
    }

    pub(crate) fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

impl From<[u8; 32]> for SecretKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(Box::new(StaticSecret::from(bytes)))
    }
}

impl From<Box<[u8; 32]>> for SecretKey {
    fn from(mut bytes: Box<[u8; 32]>) -> Self {
        let secret = StaticSecret::from(*bytes);
        bytes.zeroize();
        Self(Box::new(secret))
    }
}

/// An ephemeral X25519 key pair, used for handshake base keys and
/// ratchet keys.
#[derive(Clone)]
pub struct KeyPair {
    pub(crate) secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generates a fresh random key pair.
    pub fn new() -> Result<Self, SessionError> {
        let secret_key = SecretKey::from(random_seed()?);
        let public_key = secret_key.public_key();

        Ok(Self {
            secret_key,
            public_key,
        })
    }

}

impl Zeroize for KeyPair {
    fn zeroize(&mut self) {
        self.secret_key.zeroize();
    }
}

impl ZeroizeOnDrop for KeyPair {}
