//! Canonical binary encoding for sessions and their wire types.
//!
//! Every object encodes as a CBOR map with small integer tags, emitted in
//! ascending tag order so that equal objects produce identical bytes.
//! Decoding is tag-driven and silently skips unknown tags, which lets
//! newer writers add fields without breaking older readers.

use crate::error::{DecodeError, EncodeError};
use crate::identity::{IdentityKey, IdentityKeyPair};
use crate::kdf::{CipherKey, MacKey};
use crate::keys::{KeyPair, PublicKey, SecretKey};
use crate::message::{CipherMessage, Envelope, Message, PreKeyMessage, SessionTag};
use crate::pre_key::{PreKey, PreKeyBundle};
use crate::ratchet::{ChainKey, MessageKeys, RecvChain, RootKey, SendChain, SessionState};
use crate::session::{PendingPreKey, Session, SessionStateEntry, MAX_SESSION_STATES};
use ciborium::value::{Integer, Value};
use ed25519_dalek::{Signature, VerifyingKey};
use std::collections::{HashMap, VecDeque};
use zeroize::Zeroize;

fn uint(value: u64) -> Value {
    Value::Integer(Integer::from(value))
}

fn bytes(value: &[u8]) -> Value {
    Value::Bytes(value.to_vec())
}

/// Integer tag of a map key, if it is one.
fn tag_of(key: &Value) -> Option<u64> {
    key.as_integer().and_then(|i| u64::try_from(i).ok())
}

fn as_fields<'a>(value: &'a Value, field: &'static str) -> Result<&'a Vec<(Value, Value)>, DecodeError> {
    value.as_map().ok_or(DecodeError::InvalidType(field))
}

fn as_u64(value: &Value, field: &'static str) -> Result<u64, DecodeError> {
    value
        .as_integer()
        .and_then(|i| u64::try_from(i).ok())
        .ok_or(DecodeError::InvalidType(field))
}

fn as_u32(value: &Value, field: &'static str) -> Result<u32, DecodeError> {
    u32::try_from(as_u64(value, field)?).map_err(|_| DecodeError::InvalidType(field))
}

fn as_u16(value: &Value, field: &'static str) -> Result<u16, DecodeError> {
    u16::try_from(as_u64(value, field)?).map_err(|_| DecodeError::InvalidType(field))
}

fn as_u8(value: &Value, field: &'static str) -> Result<u8, DecodeError> {
    u8::try_from(as_u64(value, field)?).map_err(|_| DecodeError::InvalidType(field))
}

fn as_bytes<'a>(value: &'a Value, field: &'static str) -> Result<&'a [u8], DecodeError> {
    value
        .as_bytes()
        .map(|b| b.as_slice())
        .ok_or(DecodeError::InvalidType(field))
}

fn fixed_bytes<const N: usize>(value: &Value, field: &'static str) -> Result<[u8; N], DecodeError> {
    let slice = as_bytes(value, field)?;
    let mut out = [0u8; N];
    if slice.len() != N {
        return Err(DecodeError::InvalidType(field));
    }
    out.copy_from_slice(slice);
    Ok(out)
}

fn to_vec(value: &Value) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|err| EncodeError::Cbor(err.to_string()))?;
    Ok(buf)
}

fn from_slice(bytes: &[u8]) -> Result<Value, DecodeError> {
    ciborium::from_reader(bytes).map_err(|err| DecodeError::Malformed(err.to_string()))
}

// --- key material ---

impl PublicKey {
    fn to_value(self) -> Value {
        bytes(self.as_bytes())
    }

    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        Ok(PublicKey::from(fixed_bytes::<32>(value, "public key")?))
    }
}

impl IdentityKey {
    fn to_value(&self) -> Value {
        Value::Map(vec![
            (uint(0), bytes(self.signing_key_public().as_bytes())),
            (uint(1), self.dh_key_public().to_value()),
        ])
    }

    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        let mut signing_key = None;
        let mut dh_key = None;

        for (key, value) in as_fields(value, "identity key")? {
            match tag_of(key) {
                Some(0) => {
                    let raw = fixed_bytes::<32>(value, "identity signing key")?;
                    signing_key = Some(
                        VerifyingKey::from_bytes(&raw)
                            .map_err(|_| DecodeError::InvalidType("identity signing key"))?,
                    );
                }
                Some(1) => dh_key = Some(PublicKey::from_value(value)?),
                _ => {}
            }
        }

        Ok(IdentityKey::new(
            signing_key.ok_or(DecodeError::MissingField("identity signing key"))?,
            dh_key.ok_or(DecodeError::MissingField("identity dh key"))?,
        ))
    }
}

impl KeyPair {
    fn to_value(&self) -> Value {
        Value::Map(vec![
            (uint(0), bytes(&self.secret_key.to_bytes())),
            (uint(1), self.public_key.to_value()),
        ])
    }

    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        let mut secret_key = None;
        let mut public_key = None;

        for (key, value) in as_fields(value, "key pair")? {
            match tag_of(key) {
                Some(0) => {
                    secret_key = Some(SecretKey::from(fixed_bytes::<32>(value, "secret key")?))
                }
                Some(1) => public_key = Some(PublicKey::from_value(value)?),
                _ => {}
            }
        }

        let secret_key = secret_key.ok_or(DecodeError::MissingField("secret key"))?;
        let public_key = public_key.ok_or(DecodeError::MissingField("public key"))?;

        Ok(KeyPair {
            secret_key,
            public_key,
        })
    }
}

// --- pre-keys ---

impl PreKey {
    /// Serializes this pre-key for storage.
    pub fn serialise(&self) -> Result<Vec<u8>, EncodeError> {
        to_vec(&Value::Map(vec![
            (uint(0), uint(1)),
            (uint(1), uint(self.id() as u64)),
            (uint(2), self.key_pair().to_value()),
        ]))
    }

    pub fn deserialise(buf: &[u8]) -> Result<Self, DecodeError> {
        let value = from_slice(buf)?;
        let mut version = None;
        let mut id = None;
        let mut key_pair = None;

        for (key, value) in as_fields(&value, "pre-key")? {
            match tag_of(key) {
                Some(0) => version = Some(as_u8(value, "pre-key version")?),
                Some(1) => id = Some(as_u16(value, "pre-key id")?),
                Some(2) => key_pair = Some(KeyPair::from_value(value)?),
                _ => {}
            }
        }

        let version = version.ok_or(DecodeError::MissingField("pre-key version"))?;
        if version != 1 {
            return Err(DecodeError::UnsupportedVersion(version as u64));
        }

        Ok(PreKey::from_parts(
            id.ok_or(DecodeError::MissingField("pre-key id"))?,
            key_pair.ok_or(DecodeError::MissingField("pre-key key pair"))?,
        ))
    }
}

impl PreKeyBundle {
    pub fn serialise(&self) -> Result<Vec<u8>, EncodeError> {
        let signature = match &self.signature {
            Some(signature) => bytes(&signature.to_bytes()),
            None => Value::Null,
        };

        to_vec(&Value::Map(vec![
            (uint(0), uint(self.version as u64)),
            (uint(1), uint(self.prekey_id as u64)),
            (uint(2), self.public_key.to_value()),
            (uint(3), self.identity_key.to_value()),
            (uint(4), signature),
        ]))
    }

    pub fn deserialise(buf: &[u8]) -> Result<Self, DecodeError> {
        let value = from_slice(buf)?;
        let mut version = None;
        let mut prekey_id = None;
        let mut public_key = None;
        let mut identity_key = None;
        let mut signature = None;

        for (key, value) in as_fields(&value, "pre-key bundle")? {
            match tag_of(key) {
                Some(0) => version = Some(as_u8(value, "bundle version")?),
                Some(1) => prekey_id = Some(as_u16(value, "bundle pre-key id")?),
                Some(2) => public_key = Some(PublicKey::from_value(value)?),
                Some(3) => identity_key = Some(IdentityKey::from_value(value)?),
                Some(4) => {
                    signature = if value.is_null() {
                        None
                    } else {
                        Some(Signature::from_bytes(&fixed_bytes::<64>(
                            value,
                            "bundle signature",
                        )?))
                    }
                }
                _ => {}
            }
        }

        let version = version.ok_or(DecodeError::MissingField("bundle version"))?;
        if version != 1 {
            return Err(DecodeError::UnsupportedVersion(version as u64));
        }

        Ok(PreKeyBundle {
            version,
            prekey_id: prekey_id.ok_or(DecodeError::MissingField("bundle pre-key id"))?,
            public_key: public_key.ok_or(DecodeError::MissingField("bundle public key"))?,
            identity_key: identity_key.ok_or(DecodeError::MissingField("bundle identity key"))?,
            signature,
        })
    }
}

// --- messages ---

impl SessionTag {
    fn to_value(&self) -> Value {
        bytes(self.as_bytes())
    }

    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        Ok(SessionTag::from(fixed_bytes::<16>(value, "session tag")?))
    }
}

impl CipherMessage {
    fn to_value(&self) -> Value {
        Value::Map(vec![
            (uint(0), self.session_tag.to_value()),
            (uint(1), uint(self.counter as u64)),
            (uint(2), uint(self.prev_counter as u64)),
            (uint(3), self.ratchet_key.to_value()),
            (uint(4), bytes(&self.cipher_text)),
        ])
    }

    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        let mut session_tag = None;
        let mut counter = None;
        let mut prev_counter = None;
        let mut ratchet_key = None;
        let mut cipher_text = None;

        for (key, value) in as_fields(value, "cipher message")? {
            match tag_of(key) {
                Some(0) => session_tag = Some(SessionTag::from_value(value)?),
                Some(1) => counter = Some(as_u32(value, "counter")?),
                Some(2) => prev_counter = Some(as_u32(value, "previous counter")?),
                Some(3) => ratchet_key = Some(PublicKey::from_value(value)?),
                Some(4) => cipher_text = Some(as_bytes(value, "cipher text")?.to_vec()),
                _ => {}
            }
        }

        Ok(CipherMessage {
            session_tag: session_tag.ok_or(DecodeError::MissingField("session tag"))?,
            counter: counter.ok_or(DecodeError::MissingField("counter"))?,
            prev_counter: prev_counter.ok_or(DecodeError::MissingField("previous counter"))?,
            ratchet_key: ratchet_key.ok_or(DecodeError::MissingField("ratchet key"))?,
            cipher_text: cipher_text.ok_or(DecodeError::MissingField("cipher text"))?,
        })
    }
}

impl PreKeyMessage {
    fn to_value(&self) -> Value {
        Value::Map(vec![
            (uint(0), uint(self.prekey_id as u64)),
            (uint(1), self.base_key.to_value()),
            (uint(2), self.identity_key.to_value()),
            (uint(3), self.message.to_value()),
        ])
    }

    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        let mut prekey_id = None;
        let mut base_key = None;
        let mut identity_key = None;
        let mut message = None;

        for (key, value) in as_fields(value, "pre-key message")? {
            match tag_of(key) {
                Some(0) => prekey_id = Some(as_u16(value, "pre-key id")?),
                Some(1) => base_key = Some(PublicKey::from_value(value)?),
                Some(2) => identity_key = Some(IdentityKey::from_value(value)?),
                Some(3) => message = Some(CipherMessage::from_value(value)?),
                _ => {}
            }
        }

        Ok(PreKeyMessage {
            prekey_id: prekey_id.ok_or(DecodeError::MissingField("pre-key id"))?,
            base_key: base_key.ok_or(DecodeError::MissingField("base key"))?,
            identity_key: identity_key.ok_or(DecodeError::MissingField("identity key"))?,
            message: message.ok_or(DecodeError::MissingField("message"))?,
        })
    }
}

impl Message {
    fn to_value(&self) -> Value {
        match self {
            Message::Plain(message) => Value::Map(vec![(uint(1), message.to_value())]),
            Message::Keyed(message) => Value::Map(vec![(uint(2), message.to_value())]),
        }
    }

    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        let fields = as_fields(value, "message")?;
        let (key, value) = fields
            .first()
            .ok_or(DecodeError::MissingField("message"))?;

        match tag_of(key) {
            Some(1) => Ok(Message::Plain(CipherMessage::from_value(value)?)),
            Some(2) => Ok(Message::Keyed(PreKeyMessage::from_value(value)?)),
            Some(tag) => Err(DecodeError::UnknownMessageType(tag)),
            None => Err(DecodeError::InvalidType("message")),
        }
    }
}

/// Encodes a message to the exact bytes an envelope MAC covers.
pub(crate) fn message_to_bytes(message: &Message) -> Result<Vec<u8>, EncodeError> {
    to_vec(&message.to_value())
}

impl Envelope {
    pub fn serialise(&self) -> Result<Vec<u8>, EncodeError> {
        to_vec(&Value::Map(vec![
            (uint(0), uint(self.version() as u64)),
            (uint(1), bytes(self.mac())),
            (uint(2), bytes(self.message_enc())),
        ]))
    }

    pub fn deserialise(buf: &[u8]) -> Result<Self, DecodeError> {
        let value = from_slice(buf)?;
        let mut version = None;
        let mut mac = None;
        let mut message_enc = None;

        for (key, value) in as_fields(&value, "envelope")? {
            match tag_of(key) {
                Some(0) => version = Some(as_u8(value, "envelope version")?),
                Some(1) => mac = Some(fixed_bytes::<32>(value, "envelope mac")?),
                Some(2) => message_enc = Some(as_bytes(value, "envelope message")?.to_vec()),
                _ => {}
            }
        }

        let version = version.ok_or(DecodeError::MissingField("envelope version"))?;
        if version != 1 {
            return Err(DecodeError::UnsupportedVersion(version as u64));
        }

        let message_enc = message_enc.ok_or(DecodeError::MissingField("envelope message"))?;
        let message = Message::from_value(&from_slice(&message_enc)?)?;

        Ok(Envelope::from_parts(
            version,
            mac.ok_or(DecodeError::MissingField("envelope mac"))?,
            message,
            message_enc,
        ))
    }
}

// --- ratchet state ---

impl ChainKey {
    fn to_value(&self) -> Value {
        Value::Map(vec![
            (uint(0), bytes(self.key.as_bytes())),
            (uint(1), uint(self.idx as u64)),
        ])
    }

    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        let mut key = None;
        let mut idx = None;

        for (k, value) in as_fields(value, "chain key")? {
            match tag_of(k) {
                Some(0) => key = Some(fixed_bytes::<32>(value, "chain key")?),
                Some(1) => idx = Some(as_u32(value, "chain index")?),
                _ => {}
            }
        }

        Ok(ChainKey::new(
            MacKey::new(Box::new(key.ok_or(DecodeError::MissingField("chain key"))?)),
            idx.ok_or(DecodeError::MissingField("chain index"))?,
        ))
    }
}

impl MessageKeys {
    fn to_value(&self) -> Value {
        Value::Map(vec![
            (uint(0), bytes(self.cipher_key.key_bytes())),
            (uint(1), bytes(self.cipher_key.nonce_bytes())),
            (uint(2), bytes(self.mac_key.as_bytes())),
            (uint(3), uint(self.counter as u64)),
        ])
    }

    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        let mut cipher_key = None;
        let mut nonce = None;
        let mut mac_key = None;
        let mut counter = None;

        for (key, value) in as_fields(value, "message keys")? {
            match tag_of(key) {
                Some(0) => cipher_key = Some(fixed_bytes::<32>(value, "cipher key")?),
                Some(1) => nonce = Some(fixed_bytes::<12>(value, "nonce")?),
                Some(2) => mac_key = Some(fixed_bytes::<32>(value, "mac key")?),
                Some(3) => counter = Some(as_u32(value, "message counter")?),
                _ => {}
            }
        }

        Ok(MessageKeys {
            cipher_key: CipherKey::new(
                Box::new(cipher_key.ok_or(DecodeError::MissingField("cipher key"))?),
                Box::new(nonce.ok_or(DecodeError::MissingField("nonce"))?),
            ),
            mac_key: MacKey::new(Box::new(
                mac_key.ok_or(DecodeError::MissingField("mac key"))?,
            )),
            counter: counter.ok_or(DecodeError::MissingField("message counter"))?,
        })
    }
}

impl SendChain {
    fn to_value(&self) -> Value {
        Value::Map(vec![
            (uint(0), self.chain_key.to_value()),
            (uint(1), self.ratchet_key.to_value()),
        ])
    }

    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        let mut chain_key = None;
        let mut ratchet_key = None;

        for (key, value) in as_fields(value, "send chain")? {
            match tag_of(key) {
                Some(0) => chain_key = Some(ChainKey::from_value(value)?),
                Some(1) => ratchet_key = Some(KeyPair::from_value(value)?),
                _ => {}
            }
        }

        Ok(SendChain::new(
            chain_key.ok_or(DecodeError::MissingField("send chain key"))?,
            ratchet_key.ok_or(DecodeError::MissingField("send ratchet key"))?,
        ))
    }
}

impl RecvChain {
    fn to_value(&self) -> Value {
        let message_keys = self.message_keys.iter().map(MessageKeys::to_value).collect();

        Value::Map(vec![
            (uint(0), self.chain_key.to_value()),
            (uint(1), self.ratchet_key.to_value()),
            (uint(2), Value::Array(message_keys)),
        ])
    }

    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        let mut chain_key = None;
        let mut ratchet_key = None;
        let mut message_keys = VecDeque::new();

        for (key, value) in as_fields(value, "receive chain")? {
            match tag_of(key) {
                Some(0) => chain_key = Some(ChainKey::from_value(value)?),
                Some(1) => ratchet_key = Some(PublicKey::from_value(value)?),
                Some(2) => {
                    let items = value
                        .as_array()
                        .ok_or(DecodeError::InvalidType("retained message keys"))?;
                    message_keys = items
                        .iter()
                        .map(MessageKeys::from_value)
                        .collect::<Result<_, _>>()?;
                }
                _ => {}
            }
        }

        let mut chain = RecvChain::new(
            chain_key.ok_or(DecodeError::MissingField("receive chain key"))?,
            ratchet_key.ok_or(DecodeError::MissingField("receive ratchet key"))?,
        );
        chain.message_keys = message_keys;

        Ok(chain)
    }
}

impl SessionState {
    fn to_value(&self) -> Value {
        let recv_chains = self.recv_chains.iter().map(RecvChain::to_value).collect();

        Value::Map(vec![
            (uint(0), Value::Array(recv_chains)),
            (uint(1), self.send_chain.to_value()),
            (uint(2), bytes(self.root_key.key.as_slice())),
            (uint(3), uint(self.prev_counter as u64)),
        ])
    }

    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        let mut recv_chains = VecDeque::new();
        let mut send_chain = None;
        let mut root_key = None;
        let mut prev_counter = None;

        for (key, value) in as_fields(value, "session state")? {
            match tag_of(key) {
                Some(0) => {
                    let items = value
                        .as_array()
                        .ok_or(DecodeError::InvalidType("receive chains"))?;
                    recv_chains = items
                        .iter()
                        .map(RecvChain::from_value)
                        .collect::<Result<_, _>>()?;
                }
                Some(1) => send_chain = Some(SendChain::from_value(value)?),
                Some(2) => {
                    root_key = Some(RootKey::new(Box::new(fixed_bytes::<32>(
                        value, "root key",
                    )?)))
                }
                Some(3) => prev_counter = Some(as_u32(value, "previous counter")?),
                _ => {}
            }
        }

        Ok(SessionState::from_parts(
            recv_chains,
            send_chain.ok_or(DecodeError::MissingField("send chain"))?,
            root_key.ok_or(DecodeError::MissingField("root key"))?,
            prev_counter.ok_or(DecodeError::MissingField("previous counter"))?,
        ))
    }

    /// Serializes this ratchet state to its canonical bytes.
    pub fn serialise(&self) -> Result<Vec<u8>, EncodeError> {
        to_vec(&self.to_value())
    }

    pub fn deserialise(buf: &[u8]) -> Result<Self, DecodeError> {
        Self::from_value(&from_slice(buf)?)
    }
}

// --- session ---

fn pending_prekey_to_value(pending: &Option<PendingPreKey>) -> Value {
    match pending {
        None => Value::Null,
        Some(pending) => Value::Map(vec![
            (uint(0), uint(pending.prekey_id as u64)),
            (uint(1), pending.base_key.to_value()),
        ]),
    }
}

fn pending_prekey_from_value(value: &Value) -> Result<Option<PendingPreKey>, DecodeError> {
    if value.is_null() {
        return Ok(None);
    }

    let fields = value
        .as_map()
        .ok_or(DecodeError::InvalidType("pending pre-key"))?;

    let mut prekey_id = None;
    let mut base_key = None;
    for (key, value) in fields {
        match tag_of(key) {
            Some(0) => prekey_id = Some(as_u16(value, "pending pre-key id")?),
            Some(1) => base_key = Some(PublicKey::from_value(value)?),
            _ => {}
        }
    }

    match (prekey_id, base_key) {
        (Some(prekey_id), Some(base_key)) => Ok(Some(PendingPreKey {
            prekey_id,
            base_key,
        })),
        _ => Err(DecodeError::InvalidType("pending pre-key")),
    }
}

impl Session {
    /// Serializes the session to its canonical bytes.
    ///
    /// State entries are emitted in insertion order, which decode restores
    /// by reindexing from zero.
    pub fn serialise(&self) -> Result<Vec<u8>, EncodeError> {
        let mut entries: Vec<(&SessionTag, &SessionStateEntry)> =
            self.session_states.iter().collect();
        entries.sort_by_key(|(_, entry)| entry.idx);

        let states = entries
            .into_iter()
            .map(|(tag, entry)| (tag.to_value(), entry.state.to_value()))
            .collect();

        to_vec(&Value::Map(vec![
            (uint(0), uint(self.version as u64)),
            (uint(1), self.session_tag.to_value()),
            (uint(2), self.local_identity.public_key().to_value()),
            (uint(3), self.remote_identity.to_value()),
            (uint(4), pending_prekey_to_value(&self.pending_prekey)),
            (uint(5), Value::Map(states)),
        ]))
    }

    /// Restores a session from its canonical bytes.
    ///
    /// The supplied key pair must match the identity the session was
    /// serialized with; it is adopted as the session's local identity and
    /// the embedded public half is discarded after the check.
    pub fn deserialise(
        local_identity: IdentityKeyPair,
        buf: &[u8],
    ) -> Result<Session, DecodeError> {
        let value = from_slice(buf)?;

        let mut version = None;
        let mut session_tag = None;
        let mut remote_identity = None;
        let mut pending_prekey = None;
        let mut states: Vec<(SessionTag, SessionState)> = Vec::new();

        for (key, value) in as_fields(&value, "session")? {
            match tag_of(key) {
                Some(0) => version = Some(as_u8(value, "session version")?),
                Some(1) => session_tag = Some(SessionTag::from_value(value)?),
                Some(2) => {
                    let embedded = IdentityKey::from_value(value)?;
                    if embedded.fingerprint() != local_identity.fingerprint() {
                        return Err(DecodeError::LocalIdentityChanged);
                    }
                }
                Some(3) => remote_identity = Some(IdentityKey::from_value(value)?),
                Some(4) => pending_prekey = Some(pending_prekey_from_value(value)?),
                Some(5) => {
                    let entries = as_fields(value, "session states")?;
                    states = entries
                        .iter()
                        .map(|(tag, state)| {
                            Ok((SessionTag::from_value(tag)?, SessionState::from_value(state)?))
                        })
                        .collect::<Result<_, DecodeError>>()?;
                }
                _ => {}
            }
        }

        let version = version.ok_or(DecodeError::MissingField("session version"))?;
        if version != 1 {
            return Err(DecodeError::UnsupportedVersion(version as u64));
        }
        let session_tag = session_tag.ok_or(DecodeError::MissingField("session tag"))?;

        let mut session_states = HashMap::with_capacity(states.len());
        let mut counter = 0u64;
        for (tag, state) in states {
            session_states.insert(tag, SessionStateEntry { idx: counter, state });
            counter += 1;
        }

        // the current tag must name one of the decoded states
        if !session_states.is_empty() && !session_states.contains_key(&session_tag) {
            return Err(DecodeError::MissingField("current session state"));
        }

        // a blob may carry more entries than a live session ever retains;
        // shed the oldest non-current ones, as the live insert path would
        while session_states.len() > MAX_SESSION_STATES {
            let oldest = session_states
                .iter()
                .filter(|(tag, _)| **tag != session_tag)
                .min_by_key(|(_, entry)| entry.idx)
                .map(|(tag, _)| tag.clone());

            match oldest {
                Some(oldest) => {
                    if let Some(mut entry) = session_states.remove(&oldest) {
                        entry.state.zeroize();
                    }
                }
                None => break,
            }
        }

        Ok(Session {
            version,
            session_tag,
            local_identity,
            remote_identity: remote_identity
                .ok_or(DecodeError::MissingField("remote identity"))?,
            pending_prekey: pending_prekey.unwrap_or(None),
            session_states,
            counter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pre_key::PreKey;

    fn session_pair() -> (Session, IdentityKeyPair, IdentityKeyPair) {
        let alice_identity = IdentityKeyPair::new().unwrap();
        let bob_identity = IdentityKeyPair::new().unwrap();
        let prekey = PreKey::new(7).unwrap();
        let bundle = PreKeyBundle::new(bob_identity.public_key(), &prekey);

        let session = Session::init_from_prekey(alice_identity.clone(), &bundle).unwrap();
        (session, alice_identity, bob_identity)
    }

    #[test]
    fn test_session_round_trip_is_canonical() {
        let (session, alice_identity, _) = session_pair();

        let serialized = session.serialise().unwrap();
        let restored = Session::deserialise(alice_identity, &serialized).unwrap();

        assert_eq!(restored.serialise().unwrap(), serialized);
        assert_eq!(restored.session_tag, session.session_tag);
        assert_eq!(
            restored.remote_identity.fingerprint(),
            session.remote_identity.fingerprint()
        );
        assert_eq!(restored.pending_prekey, session.pending_prekey);
        assert_eq!(restored.state_count(), session.state_count());
    }

    #[test]
    fn test_session_rejects_wrong_local_identity() {
        let (session, _, _) = session_pair();
        let other_identity = IdentityKeyPair::new().unwrap();

        let serialized = session.serialise().unwrap();
        assert!(matches!(
            Session::deserialise(other_identity, &serialized),
            Err(DecodeError::LocalIdentityChanged)
        ));
    }

    #[test]
    fn test_unknown_tags_are_skipped() {
        let (session, alice_identity, _) = session_pair();
        let serialized = session.serialise().unwrap();

        // a future writer appends a field this version does not know
        let mut value = from_slice(&serialized).unwrap();
        if let Value::Map(fields) = &mut value {
            fields.push((uint(99), Value::Text("future field".to_string())));
        } else {
            panic!("expected a map");
        }
        let extended = to_vec(&value).unwrap();

        let restored = Session::deserialise(alice_identity, &extended).unwrap();
        assert_eq!(restored.session_tag, session.session_tag);
    }

    #[test]
    fn test_deserialise_rejects_tag_without_state() {
        let (session, alice_identity, _) = session_pair();
        let serialized = session.serialise().unwrap();

        // point the current tag at a branch the blob does not carry
        let mut value = from_slice(&serialized).unwrap();
        if let Value::Map(fields) = &mut value {
            for (key, field) in fields.iter_mut() {
                if tag_of(key) == Some(1) {
                    *field = Value::Bytes(vec![7u8; 16]);
                }
            }
        } else {
            panic!("expected a map");
        }
        let blob = to_vec(&value).unwrap();

        assert!(matches!(
            Session::deserialise(alice_identity, &blob),
            Err(DecodeError::MissingField("current session state"))
        ));
    }

    #[test]
    fn test_deserialise_caps_state_table() {
        let (session, alice_identity, _) = session_pair();
        let serialized = session.serialise().unwrap();
        let mut value = from_slice(&serialized).unwrap();

        let state_value = match &value {
            Value::Map(fields) => fields
                .iter()
                .find(|(key, _)| tag_of(key) == Some(5))
                .and_then(|(_, states)| states.as_map())
                .and_then(|entries| entries.first())
                .map(|(_, state)| state.clone())
                .unwrap(),
            _ => panic!("expected a map"),
        };

        // a blob with 150 branches, the newest of them current
        let overfull: Vec<(Value, Value)> = (0..150u8)
            .map(|i| {
                let mut tag = [0u8; 16];
                tag[0] = i;
                (Value::Bytes(tag.to_vec()), state_value.clone())
            })
            .collect();
        let mut current = [0u8; 16];
        current[0] = 149;

        if let Value::Map(fields) = &mut value {
            for (key, field) in fields.iter_mut() {
                match tag_of(key) {
                    Some(1) => *field = Value::Bytes(current.to_vec()),
                    Some(5) => *field = Value::Map(overfull.clone()),
                    _ => {}
                }
            }
        }
        let blob = to_vec(&value).unwrap();

        let restored = Session::deserialise(alice_identity, &blob).unwrap();
        assert_eq!(restored.state_count(), MAX_SESSION_STATES);
        assert_eq!(restored.session_tag(), &SessionTag::from(current));
        assert!(restored.session_states.contains_key(&SessionTag::from(current)));

        // the oldest entries were the ones shed
        let oldest = SessionTag::from([0u8; 16]);
        assert!(!restored.session_states.contains_key(&oldest));
    }

    #[test]
    fn test_pending_prekey_shape_is_checked() {
        assert_eq!(pending_prekey_from_value(&Value::Null), Ok(None));

        assert_eq!(
            pending_prekey_from_value(&uint(5)),
            Err(DecodeError::InvalidType("pending pre-key"))
        );

        // a map missing one of the two required fields is invalid
        let partial = Value::Map(vec![(uint(0), uint(5))]);
        assert_eq!(
            pending_prekey_from_value(&partial),
            Err(DecodeError::InvalidType("pending pre-key"))
        );
    }

    #[test]
    fn test_envelope_round_trip() {
        let (mut session, _, _) = session_pair();

        let envelope = session.encrypt(b"wire format").unwrap();
        let serialized = envelope.serialise().unwrap();
        let restored = Envelope::deserialise(&serialized).unwrap();

        assert_eq!(restored.mac(), envelope.mac());
        assert_eq!(restored.serialise().unwrap(), serialized);
    }

    #[test]
    fn test_envelope_rejects_unknown_message_variant() {
        let message_enc = to_vec(&Value::Map(vec![(uint(9), Value::Null)])).unwrap();
        let envelope = to_vec(&Value::Map(vec![
            (uint(0), uint(1)),
            (uint(1), bytes(&[0u8; 32])),
            (uint(2), bytes(&message_enc)),
        ]))
        .unwrap();

        assert!(matches!(
            Envelope::deserialise(&envelope),
            Err(DecodeError::UnknownMessageType(9))
        ));
    }

    #[test]
    fn test_pre_key_round_trip() {
        let prekey = PreKey::new(42).unwrap();
        let restored = PreKey::deserialise(&prekey.serialise().unwrap()).unwrap();

        assert_eq!(restored.id(), 42);
        assert_eq!(restored.public_key(), prekey.public_key());
    }

    #[test]
    fn test_pre_key_bundle_round_trip() {
        let identity = IdentityKeyPair::new().unwrap();
        let prekey = PreKey::new(3).unwrap();
        let bundle = PreKeyBundle::signed(&identity, &prekey);

        let restored = PreKeyBundle::deserialise(&bundle.serialise().unwrap()).unwrap();

        assert_eq!(restored.prekey_id, bundle.prekey_id);
        assert_eq!(restored.public_key, bundle.public_key);
        assert_eq!(
            restored.identity_key.fingerprint(),
            bundle.identity_key.fingerprint()
        );
        assert!(restored.verify().is_ok());
    }

    #[test]
    fn test_session_state_round_trip_after_traffic() {
        let (mut session, alice_identity, _) = session_pair();
        session.encrypt(b"advance the chain").unwrap();

        let serialized = session.serialise().unwrap();
        let restored = Session::deserialise(alice_identity, &serialized).unwrap();

        assert_eq!(restored.serialise().unwrap(), serialized);
    }
}
