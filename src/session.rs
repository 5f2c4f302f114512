use crate::error::SessionError;
use crate::identity::{IdentityKey, IdentityKeyPair};
use crate::keys::{KeyPair, PublicKey};
use crate::message::{CipherMessage, Envelope, Message, PreKeyMessage, SessionTag};
use crate::pre_key::{PreKeyBundle, PreKeyStore, MAX_PREKEY_ID};
use crate::ratchet::SessionState;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use zeroize::Zeroize;

/// Hard cap on concurrently retained ratchet states per session.
pub const MAX_SESSION_STATES: usize = 100;

/// The unconfirmed handshake of an initiator-created session.
///
/// Present from `init_from_prekey` until the first successful decrypt
/// proves the responder established the ratchet; while present, outgoing
/// messages keep carrying the full handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingPreKey {
    pub prekey_id: u16,
    pub base_key: PublicKey,
}

/// A ratchet state together with its insertion index.
///
/// The index orders entries for eviction; it is never reused while the
/// entry lives, even when the state itself is replaced.
pub(crate) struct SessionStateEntry {
    pub(crate) idx: u64,
    pub(crate) state: SessionState,
}

/// A double-ratchet messaging session with one remote identity.
///
/// A session owns a bounded collection of ratchet branches, keyed by their
/// [`SessionTag`]. Messages are encrypted on the current branch; incoming
/// messages may address any retained branch, and a pre-key handshake can
/// establish a fresh one at any time. Sessions survive re-ordering and
/// loss, and serialize to a canonical binary form for persistence.
///
/// A session is not safe for concurrent use; callers serialize access to
/// each instance. Distinct sessions are independent.
pub struct Session {
    pub(crate) version: u8,
    pub(crate) session_tag: SessionTag,
    pub(crate) local_identity: IdentityKeyPair,
    pub(crate) remote_identity: IdentityKey,
    pub(crate) pending_prekey: Option<PendingPreKey>,
    pub(crate) session_states: HashMap<SessionTag, SessionStateEntry>,
    pub(crate) counter: u64,
}

impl Session {
    /// Creates the initiator ("Alice") side of a session from a remote
    /// party's published pre-key bundle.
    ///
    /// The bundle's pre-key stays with the remote party; nothing is
    /// consumed from any store. Callers that require an authenticated
    /// bundle check [`PreKeyBundle::verify`] first.
    pub fn init_from_prekey(
        local_identity: IdentityKeyPair,
        remote_bundle: &PreKeyBundle,
    ) -> Result<Session, SessionError> {
        let alice_base = KeyPair::new()?;
        let state = SessionState::init_as_alice(&local_identity, &alice_base, remote_bundle)?;
        let session_tag = SessionTag::new()?;

        let mut session = Session {
            version: 1,
            session_tag: session_tag.clone(),
            local_identity,
            remote_identity: remote_bundle.identity_key.clone(),
            pending_prekey: Some(PendingPreKey {
                prekey_id: remote_bundle.prekey_id,
                base_key: alice_base.public_key,
            }),
            session_states: HashMap::new(),
            counter: 0,
        };
        session.insert_session_state(session_tag, state);

        Ok(session)
    }

    /// Creates the responder ("Bob") side of a session from the first
    /// received envelope, returning it together with the first plaintext.
    ///
    /// The envelope must carry a pre-key message. Unless it names the
    /// last-resort pre-key, the consumed pre-key is zeroized and removed
    /// from the store; a removal failure surfaces as
    /// [`SessionError::PreKeyRemoval`].
    pub fn init_from_message<S: PreKeyStore>(
        local_identity: IdentityKeyPair,
        store: &mut S,
        envelope: &Envelope,
    ) -> Result<(Session, Vec<u8>), SessionError<S::Error>> {
        let prekey_message = match envelope.message() {
            Message::Keyed(message) => message,
            Message::Plain(_) => return Err(SessionError::MissingPreKeyMessage),
        };

        let mut session = Session {
            version: 1,
            session_tag: prekey_message.message.session_tag.clone(),
            local_identity,
            remote_identity: prekey_message.identity_key.clone(),
            pending_prekey: None,
            session_states: HashMap::new(),
            counter: 0,
        };

        let mut state = session.new_state(store, prekey_message)?;
        let plaintext = state
            .decrypt(envelope, &prekey_message.message)
            .map_err(SessionError::generalize)?;
        session.insert_session_state(prekey_message.message.session_tag.clone(), state);

        if prekey_message.prekey_id != MAX_PREKEY_ID {
            store
                .delete_prekey(prekey_message.prekey_id)
                .map_err(|_| SessionError::PreKeyRemoval(prekey_message.prekey_id))?;
        }

        Ok((session, plaintext))
    }

    /// Derives a fresh ratchet state from a pre-key handshake.
    ///
    /// The named pre-key must exist in the store; its secret material is
    /// zeroized once the state is built. The caller decides whether the
    /// store entry is removed afterwards.
    fn new_state<S: PreKeyStore>(
        &self,
        store: &mut S,
        message: &PreKeyMessage,
    ) -> Result<SessionState, SessionError<S::Error>> {
        let mut prekey = store
            .load_prekey(message.prekey_id)
            .map_err(SessionError::PreKeyStore)?
            .ok_or(SessionError::PreKeyNotFound(message.prekey_id))?;

        let state = SessionState::init_as_bob(
            &self.local_identity,
            prekey.key_pair().clone(),
            &message.identity_key,
            &message.base_key,
        );
        prekey.zeroize();

        Ok(state)
    }

    /// Inserts or replaces the state under `tag` and makes it the current
    /// branch, evicting the oldest other branch once the table is full.
    fn insert_session_state(&mut self, tag: SessionTag, state: SessionState) {
        if !self.session_states.contains_key(&tag) && self.counter == u64::MAX {
            // unreachable with a 64-bit counter, kept as a safety valve
            log::warn!("session state counter exhausted, resetting the state table");
            for entry in self.session_states.values_mut() {
                entry.state.zeroize();
            }
            self.session_states.clear();
            self.counter = 0;
        }

        match self.session_states.entry(tag.clone()) {
            Entry::Occupied(mut occupied) => {
                // replacing a state must not refresh its eviction priority
                occupied.get_mut().state = state;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(SessionStateEntry {
                    idx: self.counter,
                    state,
                });
                self.counter += 1;
            }
        }

        if self.session_tag != tag {
            self.session_tag = tag;
        }

        if self.session_states.len() >= MAX_SESSION_STATES {
            self.evict_oldest_session_state();
        }
    }

    /// Zeroizes and removes the longest-retained state that is not the
    /// current branch.
    fn evict_oldest_session_state(&mut self) {
        let oldest = self
            .session_states
            .iter()
            .filter(|(tag, _)| **tag != self.session_tag)
            .min_by_key(|(_, entry)| entry.idx)
            .map(|(tag, _)| tag.clone());

        if let Some(tag) = oldest {
            log::debug!("evicting ratchet state {tag}");
            if let Some(mut entry) = self.session_states.remove(&tag) {
                entry.state.zeroize();
            }
        }
    }

    /// Encrypts `plaintext` on the current ratchet branch.
    ///
    /// While the session still carries an unconfirmed handshake, the
    /// result wraps the message in a pre-key handshake; either way the
    /// state table is left untouched apart from the advanced chain.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Envelope, SessionError> {
        let local_identity = self.local_identity.public_key();
        let entry = self
            .session_states
            .get_mut(&self.session_tag)
            .ok_or(SessionError::MissingSessionState)?;

        entry.state.encrypt(
            &local_identity,
            self.pending_prekey.as_ref(),
            &self.session_tag,
            plaintext,
        )
    }

    /// Decrypts an incoming envelope, updating or creating ratchet state.
    ///
    /// A failed decrypt leaves the session exactly as it was; a successful
    /// one commits the advanced state and clears any pending handshake
    /// before returning.
    pub fn decrypt<S: PreKeyStore>(
        &mut self,
        store: &mut S,
        envelope: &Envelope,
    ) -> Result<Vec<u8>, SessionError<S::Error>> {
        match envelope.message() {
            Message::Plain(message) => self.decrypt_cipher_message(envelope, message),
            Message::Keyed(message) => self.decrypt_prekey_message(store, envelope, message),
        }
    }

    fn decrypt_cipher_message<E>(
        &mut self,
        envelope: &Envelope,
        message: &CipherMessage,
    ) -> Result<Vec<u8>, SessionError<E>> {
        let entry = self
            .session_states
            .get(&message.session_tag)
            .ok_or(SessionError::UnknownSessionTag)?;

        // Decrypt on a copy: the ratchet advances its chains before the
        // payload is authenticated, and a failure must not desynchronize
        // the live state.
        let mut state = entry.state.clone();
        let plaintext = state
            .decrypt(envelope, message)
            .map_err(SessionError::generalize)?;

        self.pending_prekey = None;
        self.insert_session_state(message.session_tag.clone(), state);

        Ok(plaintext)
    }

    fn decrypt_prekey_message<S: PreKeyStore>(
        &mut self,
        store: &mut S,
        envelope: &Envelope,
        message: &PreKeyMessage,
    ) -> Result<Vec<u8>, SessionError<S::Error>> {
        if message.identity_key.fingerprint() != self.remote_identity.fingerprint() {
            log::warn!("remote identity changed on session branch {}", self.session_tag);
            return Err(SessionError::RemoteIdentityChanged);
        }

        match self.decrypt_cipher_message(envelope, &message.message) {
            Err(err) if err.is_recoverable() => {
                // The handshake outranks the stale or unknown branch: build
                // a fresh ratchet from the named pre-key.
                log::debug!(
                    "establishing fresh ratchet {} from pre-key message",
                    message.message.session_tag
                );
                let mut state = self.new_state(store, message)?;
                let plaintext = state
                    .decrypt(envelope, &message.message)
                    .map_err(SessionError::generalize)?;

                if message.prekey_id != MAX_PREKEY_ID {
                    store
                        .delete_prekey(message.prekey_id)
                        .map_err(SessionError::PreKeyStore)?;
                }

                self.insert_session_state(message.message.session_tag.clone(), state);
                self.pending_prekey = None;

                Ok(plaintext)
            }
            other => other,
        }
    }

    /// Tag of the current ratchet branch.
    pub fn session_tag(&self) -> &SessionTag {
        &self.session_tag
    }

    /// The local identity this session encrypts as.
    pub fn local_identity(&self) -> &IdentityKeyPair {
        &self.local_identity
    }

    /// The pinned identity of the remote party.
    pub fn remote_identity(&self) -> &IdentityKey {
        &self.remote_identity
    }

    /// The unconfirmed handshake, while one is outstanding.
    pub fn pending_prekey(&self) -> Option<&PendingPreKey> {
        self.pending_prekey.as_ref()
    }

    /// Number of currently retained ratchet branches.
    pub fn state_count(&self) -> usize {
        self.session_states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pre_key::PreKey;
    use crate::ratchet::SessionState;

    fn test_session() -> Session {
        let local_identity = IdentityKeyPair::new().unwrap();
        let remote_identity = IdentityKeyPair::new().unwrap();
        let prekey = PreKey::new(1).unwrap();
        let bundle = PreKeyBundle::new(remote_identity.public_key(), &prekey);

        Session::init_from_prekey(local_identity, &bundle).unwrap()
    }

    fn dummy_state(session: &Session) -> SessionState {
        session
            .session_states
            .get(&session.session_tag)
            .unwrap()
            .state
            .clone()
    }

    #[test]
    fn test_initial_insertion_sets_current_tag() {
        let session = test_session();

        assert_eq!(session.state_count(), 1);
        assert!(session.session_states.contains_key(&session.session_tag));
        assert_eq!(session.counter, 1);
    }

    #[test]
    fn test_insertion_promotes_tag() {
        let mut session = test_session();
        let state = dummy_state(&session);

        let tag = SessionTag::new().unwrap();
        session.insert_session_state(tag.clone(), state);

        assert_eq!(session.session_tag, tag);
        assert_eq!(session.state_count(), 2);
    }

    #[test]
    fn test_replacement_keeps_insertion_index() {
        let mut session = test_session();
        let state = dummy_state(&session);
        let tag = session.session_tag.clone();

        let idx_before = session.session_states.get(&tag).unwrap().idx;
        let counter_before = session.counter;

        session.insert_session_state(tag.clone(), state);

        assert_eq!(session.session_states.get(&tag).unwrap().idx, idx_before);
        assert_eq!(session.counter, counter_before);
    }

    #[test]
    fn test_eviction_drops_oldest_non_current_state() {
        let mut session = test_session();
        let state = dummy_state(&session);
        let first_tag = session.session_tag.clone();

        let mut tags = vec![first_tag.clone()];
        while session.state_count() < MAX_SESSION_STATES - 1 {
            let tag = SessionTag::new().unwrap();
            tags.push(tag.clone());
            session.insert_session_state(tag, state.clone());
        }
        assert_eq!(session.state_count(), MAX_SESSION_STATES - 1);

        // the next insertion reaches the cap and evicts the oldest entry
        let tag = SessionTag::new().unwrap();
        session.insert_session_state(tag.clone(), state.clone());

        assert_eq!(session.state_count(), MAX_SESSION_STATES - 1);
        assert!(!session.session_states.contains_key(&first_tag));
        assert!(session.session_states.contains_key(&tag));
    }

    #[test]
    fn test_current_state_is_never_evicted() {
        let mut session = test_session();
        let state = dummy_state(&session);

        for _ in 0..(3 * MAX_SESSION_STATES) {
            let tag = SessionTag::new().unwrap();
            session.insert_session_state(tag.clone(), state.clone());
            assert!(session.session_states.contains_key(&session.session_tag));
            assert_eq!(session.session_tag, tag);
        }

        assert!(session.state_count() < MAX_SESSION_STATES);
    }

    #[test]
    fn test_counter_exhaustion_resets_state_table() {
        let mut session = test_session();
        let state = dummy_state(&session);

        session.counter = u64::MAX;
        let tag = SessionTag::new().unwrap();
        session.insert_session_state(tag.clone(), state);

        assert_eq!(session.state_count(), 1);
        assert!(session.session_states.contains_key(&tag));
        assert_eq!(session.session_states.get(&tag).unwrap().idx, 0);
        assert_eq!(session.counter, 1);
    }

    #[test]
    fn test_encrypt_does_not_touch_pending_prekey() {
        let mut session = test_session();
        assert!(session.pending_prekey().is_some());

        session.encrypt(b"hello").unwrap();
        session.encrypt(b"world").unwrap();

        assert!(session.pending_prekey().is_some());
        assert_eq!(session.state_count(), 1);
    }
}
