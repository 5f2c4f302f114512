use std::convert::Infallible;

/// Errors raised while driving a [`Session`](crate::Session).
///
/// `E` is the error type of the caller's [`PreKeyStore`](crate::PreKeyStore).
/// Operations that never touch a store leave it at the [`Infallible`]
/// default.
#[derive(thiserror::Error, Debug)]
pub enum SessionError<E = Infallible> {
    /// The store has no pre-key under the requested id.
    #[error("pre-key {0} not found in store")]
    PreKeyNotFound(u16),

    /// No ratchet state exists for the current session tag.
    #[error("no ratchet state for the current session tag")]
    MissingSessionState,

    /// The first message of a session must carry a pre-key handshake.
    #[error("expected a pre-key message")]
    MissingPreKeyMessage,

    /// The consumed pre-key could not be removed from the store.
    #[error("pre-key {0} could not be removed from the store")]
    PreKeyRemoval(u16),

    /// The sender's identity key no longer matches the pinned identity.
    #[error("remote identity changed")]
    RemoteIdentityChanged,

    /// No ratchet state matches the message's session tag.
    #[error("unknown session tag")]
    UnknownSessionTag,

    /// The envelope's MAC does not verify under the derived message keys.
    #[error("invalid signature")]
    InvalidSignature,

    /// The message cannot be applied to the addressed ratchet state.
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    /// The message key for this counter was already consumed.
    #[error("duplicate message")]
    DuplicateMessage,

    /// The message predates the oldest retained key of its chain.
    #[error("outdated message")]
    OutdatedMessage,

    /// The message counter skips further ahead than the retained window.
    #[error("message counter too far in the future")]
    TooDistantFuture,

    /// Random number generation failed.
    #[error("random number generation failed")]
    Random,

    /// A low-level cryptographic operation failed.
    #[error("cryptographic operation failed: {0}")]
    Crypto(&'static str),

    /// The pre-key store failed.
    #[error("pre-key store error: {0}")]
    PreKeyStore(E),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl<E> SessionError<E> {
    /// Historical numeric code for this error kind, where one exists.
    ///
    /// The codes are kept stable so log lines stay comparable across
    /// deployments of different implementations.
    pub fn code(&self) -> Option<u16> {
        match self {
            SessionError::PreKeyNotFound(_) => Some(101),
            SessionError::MissingSessionState => Some(102),
            SessionError::MissingPreKeyMessage => Some(201),
            SessionError::PreKeyRemoval(_) => Some(203),
            SessionError::RemoteIdentityChanged => Some(204),
            SessionError::UnknownSessionTag => Some(205),
            _ => None,
        }
    }

    /// True for the kinds a pre-key message may recover from by
    /// establishing a fresh ratchet.
    pub(crate) fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::InvalidSignature
                | SessionError::InvalidMessage(_)
                | SessionError::UnknownSessionTag
        )
    }
}

impl SessionError {
    /// Re-types a store-free error into a store-aware context.
    pub(crate) fn generalize<E>(self) -> SessionError<E> {
        match self {
            SessionError::PreKeyNotFound(id) => SessionError::PreKeyNotFound(id),
            SessionError::MissingSessionState => SessionError::MissingSessionState,
            SessionError::MissingPreKeyMessage => SessionError::MissingPreKeyMessage,
            SessionError::PreKeyRemoval(id) => SessionError::PreKeyRemoval(id),
            SessionError::RemoteIdentityChanged => SessionError::RemoteIdentityChanged,
            SessionError::UnknownSessionTag => SessionError::UnknownSessionTag,
            SessionError::InvalidSignature => SessionError::InvalidSignature,
            SessionError::InvalidMessage(reason) => SessionError::InvalidMessage(reason),
            SessionError::DuplicateMessage => SessionError::DuplicateMessage,
            SessionError::OutdatedMessage => SessionError::OutdatedMessage,
            SessionError::TooDistantFuture => SessionError::TooDistantFuture,
            SessionError::Random => SessionError::Random,
            SessionError::Crypto(reason) => SessionError::Crypto(reason),
            SessionError::PreKeyStore(e) => match e {},
            SessionError::Decode(e) => SessionError::Decode(e),
            SessionError::Encode(e) => SessionError::Encode(e),
        }
    }
}

/// Errors raised while decoding the canonical binary format.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum DecodeError {
    /// The embedded local identity does not match the supplied key pair.
    #[error("local identity changed")]
    LocalIdentityChanged,

    /// A field held a value of the wrong type or shape.
    #[error("unexpected type for {0}")]
    InvalidType(&'static str),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("unsupported version {0}")]
    UnsupportedVersion(u64),

    /// The message object carried a variant tag this version does not know.
    #[error("unknown message type {0}")]
    UnknownMessageType(u64),

    #[error("malformed input: {0}")]
    Malformed(String),
}

impl DecodeError {
    /// Historical numeric code for this error kind, where one exists.
    pub fn code(&self) -> Option<u16> {
        match self {
            DecodeError::UnknownMessageType(_) => Some(200),
            DecodeError::LocalIdentityChanged => Some(300),
            DecodeError::InvalidType(_) => Some(301),
            _ => None,
        }
    }
}

/// Errors raised while encoding the canonical binary format.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum EncodeError {
    #[error("encoding failed: {0}")]
    Cbor(String),
}
