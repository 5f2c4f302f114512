mod chain;

pub use chain::MAX_COUNTER_GAP;
pub(crate) use chain::{ChainKey, MessageKeys, RecvChain, SendChain};

use crate::error::SessionError;
use crate::identity::{IdentityKey, IdentityKeyPair};
use crate::kdf::{hkdf_sha256, MacKey};
use crate::keys::{KeyPair, PublicKey};
use crate::message::{CipherMessage, Envelope, Message, PreKeyMessage, SessionTag};
use crate::pre_key::PreKeyBundle;
use crate::session::PendingPreKey;
use std::cmp::Ordering;
use std::collections::VecDeque;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Maximum number of receiving chains kept per ratchet state.
pub const MAX_RECV_CHAINS: usize = 5;

const HANDSHAKE_INFO: &[u8] = b"Nereus-Handshake";
const RATCHET_INFO: &[u8] = b"Nereus-Ratchet";

/// Root of the Diffie-Hellman ratchet.
#[derive(Clone)]
pub(crate) struct RootKey {
    pub(crate) key: Box<[u8; 32]>,
}

impl RootKey {
    pub(crate) fn new(key: Box<[u8; 32]>) -> Self {
        Self { key }
    }

    /// Advances the DH ratchet, yielding the next root and chain keys.
    pub(crate) fn dh_ratchet(&self, ratchet: &KeyPair, public_key: &PublicKey) -> (RootKey, ChainKey) {
        let dh_output = ratchet.secret_key.dh(public_key);

        let mut okm = [0u8; 64];
        hkdf_sha256(Some(self.key.as_slice()), dh_output.as_bytes(), RATCHET_INFO, &mut okm);

        let mut root = Box::new([0u8; 32]);
        root.copy_from_slice(&okm[0..32]);
        let mut chain = Box::new([0u8; 32]);
        chain.copy_from_slice(&okm[32..64]);
        okm.zeroize();

        (RootKey::new(root), ChainKey::new(MacKey::new(chain), 0))
    }
}

impl Zeroize for RootKey {
    fn zeroize(&mut self) {
        self.key.zeroize();
    }
}

impl ZeroizeOnDrop for RootKey {}

/// Derives the initial root and chain keys from the handshake master key.
fn derive_initial_keys(master_key: &[u8]) -> (RootKey, ChainKey) {
    let mut okm = [0u8; 64];
    hkdf_sha256(None, master_key, HANDSHAKE_INFO, &mut okm);

    let mut root = Box::new([0u8; 32]);
    root.copy_from_slice(&okm[0..32]);
    let mut chain = Box::new([0u8; 32]);
    chain.copy_from_slice(&okm[32..64]);
    okm.zeroize();

    (RootKey::new(root), ChainKey::new(MacKey::new(chain), 0))
}

/// Per-branch ratchet state: one sending chain, a bounded set of receiving
/// chains and the evolving root key.
///
/// A state advances with every message and provides forward secrecy within
/// its branch. It is deliberately cheap to clone so callers can attempt a
/// decrypt on a copy and only commit the advanced copy on success.
#[derive(Clone)]
pub struct SessionState {
    pub(crate) recv_chains: VecDeque<RecvChain>,
    pub(crate) send_chain: SendChain,
    pub(crate) root_key: RootKey,
    pub(crate) prev_counter: u32,
}

impl SessionState {
    /// Builds the initiator's ratchet from a triple Diffie-Hellman
    /// handshake against the responder's published pre-key bundle.
    pub(crate) fn init_as_alice(
        alice_identity: &IdentityKeyPair,
        alice_base: &KeyPair,
        bob_bundle: &PreKeyBundle,
    ) -> Result<SessionState, SessionError> {
        let mut master_key = Box::new([0u8; 96]);
        master_key[0..32].copy_from_slice(alice_identity.dh(&bob_bundle.public_key).as_bytes());
        master_key[32..64].copy_from_slice(
            alice_base
                .secret_key
                .dh(&bob_bundle.identity_key.dh_key_public())
                .as_bytes(),
        );
        master_key[64..96]
            .copy_from_slice(alice_base.secret_key.dh(&bob_bundle.public_key).as_bytes());

        let (root_key, chain_key) = derive_initial_keys(master_key.as_slice());
        master_key.zeroize();

        // the responder's first messages arrive on its pre-key ratchet
        let mut recv_chains = VecDeque::with_capacity(MAX_RECV_CHAINS);
        recv_chains.push_back(RecvChain::new(chain_key, bob_bundle.public_key));

        let send_ratchet = KeyPair::new()?;
        let (root_key, send_chain_key) = root_key.dh_ratchet(&send_ratchet, &bob_bundle.public_key);

        Ok(SessionState {
            recv_chains,
            send_chain: SendChain::new(send_chain_key, send_ratchet),
            root_key,
            prev_counter: 0,
        })
    }

    /// Builds the responder's ratchet from the handshake material carried
    /// by the initiator's first message.
    pub(crate) fn init_as_bob(
        bob_identity: &IdentityKeyPair,
        bob_prekey: KeyPair,
        alice_identity: &IdentityKey,
        alice_base: &PublicKey,
    ) -> SessionState {
        let mut master_key = Box::new([0u8; 96]);
        master_key[0..32].copy_from_slice(
            bob_prekey
                .secret_key
                .dh(&alice_identity.dh_key_public())
                .as_bytes(),
        );
        master_key[32..64].copy_from_slice(bob_identity.dh(alice_base).as_bytes());
        master_key[64..96].copy_from_slice(bob_prekey.secret_key.dh(alice_base).as_bytes());

        let (root_key, chain_key) = derive_initial_keys(master_key.as_slice());
        master_key.zeroize();

        SessionState {
            recv_chains: VecDeque::with_capacity(MAX_RECV_CHAINS),
            send_chain: SendChain::new(chain_key, bob_prekey),
            root_key,
            prev_counter: 0,
        }
    }

    pub(crate) fn from_parts(
        recv_chains: VecDeque<RecvChain>,
        send_chain: SendChain,
        root_key: RootKey,
        prev_counter: u32,
    ) -> SessionState {
        SessionState {
            recv_chains,
            send_chain,
            root_key,
            prev_counter,
        }
    }

    /// Turns the DH ratchet after the remote side presented a new
    /// ratchet key.
    fn ratchet(&mut self, ratchet_key: PublicKey) -> Result<(), SessionError> {
        let new_ratchet = KeyPair::new()?;
        let (recv_root_key, recv_chain_key) =
            self.root_key
                .dh_ratchet(&self.send_chain.ratchet_key, &ratchet_key);
        let (send_root_key, send_chain_key) = recv_root_key.dh_ratchet(&new_ratchet, &ratchet_key);

        self.recv_chains
            .push_front(RecvChain::new(recv_chain_key, ratchet_key));
        self.recv_chains.truncate(MAX_RECV_CHAINS);

        self.prev_counter = self.send_chain.chain_key.idx;
        self.root_key = send_root_key;
        self.send_chain = SendChain::new(send_chain_key, new_ratchet);

        Ok(())
    }

    /// Encrypts `plaintext` as the next message of the sending chain.
    ///
    /// The result is wrapped in a pre-key handshake while `pending_prekey`
    /// is set, so the responder can establish the ratchet from any of the
    /// initiator's early messages.
    pub(crate) fn encrypt(
        &mut self,
        local_identity: &IdentityKey,
        pending_prekey: Option<&PendingPreKey>,
        session_tag: &SessionTag,
        plaintext: &[u8],
    ) -> Result<Envelope, SessionError> {
        let message_keys = self.send_chain.chain_key.message_keys();
        let cipher_text = message_keys.encrypt(plaintext)?;

        let message = CipherMessage {
            session_tag: session_tag.clone(),
            counter: self.send_chain.chain_key.idx,
            prev_counter: self.prev_counter,
            ratchet_key: self.send_chain.ratchet_key.public_key,
            cipher_text,
        };

        let message = match pending_prekey {
            Some(pending) => Message::Keyed(PreKeyMessage {
                prekey_id: pending.prekey_id,
                base_key: pending.base_key,
                identity_key: local_identity.clone(),
                message,
            }),
            None => Message::Plain(message),
        };

        let envelope = Envelope::new(message_keys.mac_key(), message)?;
        self.send_chain.chain_key = self.send_chain.chain_key.next();

        Ok(envelope)
    }

    /// Decrypts a message addressed to this ratchet branch.
    ///
    /// Advances chains and may turn the DH ratchet; callers that need
    /// failure atomicity run this on a clone and commit on success.
    pub(crate) fn decrypt(
        &mut self,
        envelope: &Envelope,
        message: &CipherMessage,
    ) -> Result<Vec<u8>, SessionError> {
        let idx = match self
            .recv_chains
            .iter()
            .position(|chain| chain.ratchet_key == message.ratchet_key)
        {
            Some(idx) => idx,
            None => {
                self.ratchet(message.ratchet_key)?;
                0
            }
        };

        let chain = &mut self.recv_chains[idx];
        match message.counter.cmp(&chain.chain_key.idx) {
            Ordering::Less => {
                let message_keys = chain.try_message_keys(message.counter)?;
                if !envelope.verify(message_keys.mac_key()) {
                    return Err(SessionError::InvalidSignature);
                }
                message_keys.decrypt(&message.cipher_text)
            }
            _ => {
                let (chain_key, message_keys, staged) =
                    chain.stage_message_keys(message.counter)?;
                if !envelope.verify(message_keys.mac_key()) {
                    return Err(SessionError::InvalidSignature);
                }
                let plaintext = message_keys.decrypt(&message.cipher_text)?;

                chain.chain_key = chain_key.next();
                chain.commit_message_keys(staged);

                Ok(plaintext)
            }
        }
    }
}

impl Zeroize for SessionState {
    fn zeroize(&mut self) {
        for chain in self.recv_chains.iter_mut() {
            chain.zeroize();
        }
        self.recv_chains.clear();
        self.send_chain.zeroize();
        self.root_key.zeroize();
        self.prev_counter = 0;
    }
}

impl ZeroizeOnDrop for SessionState {}
