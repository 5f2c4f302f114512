//! Double-ratchet secure messaging sessions with pre-key handshakes.
//!
//! A [`Session`] is an end-to-end encrypted channel between two long-term
//! identities. The initiator builds one from the responder's published
//! [`PreKeyBundle`]; the responder builds the matching side from the first
//! received [`Envelope`]. Sessions tolerate message re-ordering and loss,
//! recover from lost state through fresh pre-key handshakes, and
//! serialize to a canonical binary form for persistence.

mod codec;
mod error;
mod identity;
mod kdf;
mod keys;
mod message;
mod pre_key;
mod ratchet;
mod session;

pub use error::{DecodeError, EncodeError, SessionError};
pub use identity::{IdentityKey, IdentityKeyPair};
pub use keys::{KeyPair, PublicKey, SecretKey};
pub use message::{CipherMessage, Envelope, Message, PreKeyMessage, SessionTag};
pub use pre_key::{PreKey, PreKeyBundle, PreKeyStore, MAX_PREKEY_ID};
pub use ratchet::{SessionState, MAX_COUNTER_GAP, MAX_RECV_CHAINS};
pub use session::{PendingPreKey, Session, MAX_SESSION_STATES};
