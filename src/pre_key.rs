use crate::error::SessionError;
use crate::identity::{IdentityKey, IdentityKeyPair};
use crate::keys::{KeyPair, PublicKey};
use ed25519_dalek::Signature;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Highest pre-key id; marks the last-resort pre-key.
///
/// The last-resort pre-key is handed out when the one-time pool is
/// exhausted and, unlike every other pre-key, is never consumed.
pub const MAX_PREKEY_ID: u16 = u16::MAX;

/// A one-time pre-key: a published X25519 key pair that a remote party
/// consumes to initiate a session.
#[derive(Clone)]
pub struct PreKey {
    id: u16,
    key_pair: KeyPair,
}

impl PreKey {
    /// Creates a new pre-key with the given id.
    pub fn new(id: u16) -> Result<Self, SessionError> {
        Ok(Self {
            id,
            key_pair: KeyPair::new()?,
        })
    }

    /// Creates the last-resort pre-key.
    pub fn last_resort() -> Result<Self, SessionError> {
        Self::new(MAX_PREKEY_ID)
    }

    /// Generates `count` pre-keys with consecutive ids starting at `start`,
    /// wrapping around before the last-resort id.
    pub fn generate(start: u16, count: u16) -> Result<Vec<Self>, SessionError> {
        (0..count)
            .map(|i| {
                let id = ((start as u32 + i as u32) % MAX_PREKEY_ID as u32) as u16;
                Self::new(id)
            })
            .collect()
    }

    /// Returns the unique identifier for this pre-key.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Returns the public component of this pre-key.
    pub fn public_key(&self) -> PublicKey {
        self.key_pair.public_key
    }

    pub(crate) fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub(crate) fn from_parts(id: u16, key_pair: KeyPair) -> Self {
        Self { id, key_pair }
    }
}

impl Zeroize for PreKey {
    fn zeroize(&mut self) {
        self.id = 0;
        self.key_pair.zeroize();
    }
}

impl ZeroizeOnDrop for PreKey {}

/// A bundle of public keys another party publishes so that sessions can be
/// initiated towards it.
///
/// A bundle may carry a signature by the owner's identity key over the
/// pre-key public bytes, letting initiators authenticate it before use.
#[derive(Clone)]
pub struct PreKeyBundle {
    pub version: u8,
    pub prekey_id: u16,
    pub public_key: PublicKey,
    pub identity_key: IdentityKey,
    pub signature: Option<Signature>,
}

impl PreKeyBundle {
    /// Creates an unsigned bundle from a pre-key and its owner's identity.
    pub fn new(identity_key: IdentityKey, pre_key: &PreKey) -> Self {
        Self {
            version: 1,
            prekey_id: pre_key.id(),
            public_key: pre_key.public_key(),
            identity_key,
            signature: None,
        }
    }

    /// Creates a bundle signed with the owner's identity key.
    pub fn signed(identity: &IdentityKeyPair, pre_key: &PreKey) -> Self {
        let signature = identity.sign(pre_key.public_key().as_bytes());

        Self {
            version: 1,
            prekey_id: pre_key.id(),
            public_key: pre_key.public_key(),
            identity_key: identity.public_key(),
            signature: Some(signature),
        }
    }

    /// Verifies the bundle's signature against its identity key.
    ///
    /// Unsigned bundles fail verification; callers that accept them should
    /// not call this.
    pub fn verify(&self) -> Result<(), SessionError> {
        match &self.signature {
            Some(signature) => self
                .identity_key
                .verify(self.public_key.as_bytes(), signature),
            None => Err(SessionError::InvalidSignature),
        }
    }
}

/// External persistence for one-time pre-keys.
///
/// Lookup misses are expressed as `Ok(None)` rather than errors; `Err` is
/// reserved for storage failures.
pub trait PreKeyStore {
    type Error;

    /// Returns the pre-key stored under `id`, or `None` when absent.
    fn load_prekey(&mut self, id: u16) -> Result<Option<PreKey>, Self::Error>;

    /// Removes the pre-key stored under `id`.
    fn delete_prekey(&mut self, id: u16) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pre_key_creation() {
        let pre_key = PreKey::new(13).unwrap();

        assert_eq!(pre_key.id(), 13);
        assert!(!pre_key.public_key().as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_last_resort_id() {
        let pre_key = PreKey::last_resort().unwrap();
        assert_eq!(pre_key.id(), MAX_PREKEY_ID);
    }

    #[test]
    fn test_generate_wraps_before_last_resort() {
        let keys = PreKey::generate(MAX_PREKEY_ID - 2, 4).unwrap();
        let ids: Vec<u16> = keys.iter().map(|k| k.id()).collect();

        assert_eq!(ids, vec![MAX_PREKEY_ID - 2, MAX_PREKEY_ID - 1, 0, 1]);
    }

    #[test]
    fn test_signed_bundle_verification() {
        let identity = IdentityKeyPair::new().unwrap();
        let pre_key = PreKey::new(1).unwrap();

        let bundle = PreKeyBundle::signed(&identity, &pre_key);
        assert!(bundle.verify().is_ok());

        // A bundle signed by someone else must not verify
        let other = IdentityKeyPair::new().unwrap();
        let mut forged = bundle.clone();
        forged.identity_key = other.public_key();
        assert!(forged.verify().is_err());
    }

    #[test]
    fn test_unsigned_bundle_fails_verification() {
        let identity = IdentityKeyPair::new().unwrap();
        let pre_key = PreKey::new(1).unwrap();

        let bundle = PreKeyBundle::new(identity.public_key(), &pre_key);
        assert!(bundle.verify().is_err());
    }
}
