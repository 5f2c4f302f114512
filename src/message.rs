use crate::error::{EncodeError, SessionError};
use crate::identity::IdentityKey;
use crate::kdf::MacKey;
use crate::keys::{random_bytes, PublicKey};
use std::fmt;

/// Random identifier naming one ratchet branch within a session.
///
/// Two parties agree on a tag when a ratchet is established and carry it in
/// every message on that branch. Its hexadecimal form is the canonical
/// string representation.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionTag([u8; 16]);

impl SessionTag {
    /// Creates a fresh random tag.
    pub fn new() -> Result<Self, SessionError> {
        Ok(Self(*random_bytes::<16>()?))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<[u8; 16]> for SessionTag {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for SessionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SessionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionTag({})", self)
    }
}

/// An encrypted message on one ratchet branch.
///
/// Carries the ratchet metadata the receiver needs to derive the matching
/// message key: the branch tag, the chain counters and the sender's current
/// ratchet key.
#[derive(Clone)]
pub struct CipherMessage {
    pub session_tag: SessionTag,
    pub counter: u32,
    pub prev_counter: u32,
    pub ratchet_key: PublicKey,
    pub cipher_text: Vec<u8>,
}

/// First-flight wrapper binding a ciphertext to the pre-key handshake that
/// created its ratchet.
///
/// Senders keep wrapping messages this way until the first reply proves the
/// handshake completed on the other side.
#[derive(Clone)]
pub struct PreKeyMessage {
    pub prekey_id: u16,
    pub base_key: PublicKey,
    pub identity_key: IdentityKey,
    pub message: CipherMessage,
}

/// The two message variants a session can transport.
#[derive(Clone)]
pub enum Message {
    Plain(CipherMessage),
    Keyed(PreKeyMessage),
}

/// Transport wrapper: a versioned, authenticated encoding of a message.
///
/// The MAC is computed with the per-message MAC key over the exact encoded
/// message bytes, which are retained so that verification and
/// re-serialization stay byte-identical.
#[derive(Clone)]
pub struct Envelope {
    version: u8,
    mac: [u8; 32],
    message: Message,
    message_enc: Vec<u8>,
}

impl Envelope {
    pub(crate) fn new(mac_key: &MacKey, message: Message) -> Result<Self, EncodeError> {
        let message_enc = crate::codec::message_to_bytes(&message)?;
        let mac = mac_key.sign(&message_enc);

        Ok(Self {
            version: 1,
            mac,
            message,
            message_enc,
        })
    }

    pub(crate) fn from_parts(version: u8, mac: [u8; 32], message: Message, message_enc: Vec<u8>) -> Self {
        Self {
            version,
            mac,
            message,
            message_enc,
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn mac(&self) -> &[u8; 32] {
        &self.mac
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub(crate) fn message_enc(&self) -> &[u8] {
        &self.message_enc
    }

    /// Checks the envelope's MAC under the given key.
    pub(crate) fn verify(&self, mac_key: &MacKey) -> bool {
        mac_key.verify(&self.mac, &self.message_enc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_tag_uniqueness() {
        let a = SessionTag::new().unwrap();
        let b = SessionTag::new().unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn test_session_tag_string_form() {
        let tag = SessionTag::from([0xab; 16]);

        assert_eq!(tag.to_string(), "ab".repeat(16));
    }

    #[test]
    fn test_envelope_mac_verification() {
        let mac_key = MacKey::new(Box::new([5u8; 32]));
        let message = Message::Plain(CipherMessage {
            session_tag: SessionTag::from([1u8; 16]),
            counter: 0,
            prev_counter: 0,
            ratchet_key: PublicKey::from([2u8; 32]),
            cipher_text: b"opaque".to_vec(),
        });

        let envelope = Envelope::new(&mac_key, message).unwrap();
        assert!(envelope.verify(&mac_key));

        let wrong_key = MacKey::new(Box::new([6u8; 32]));
        assert!(!envelope.verify(&wrong_key));
    }
}
