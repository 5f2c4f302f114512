use crate::error::SessionError;
use crate::kdf::{hkdf_sha256, hmac_sha256, CipherKey, MacKey};
use crate::keys::{KeyPair, PublicKey};
use std::collections::VecDeque;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Maximum number of message keys retained per receiving chain for
/// out-of-order delivery; also bounds how far a counter may skip ahead.
pub const MAX_COUNTER_GAP: usize = 1000;

const MESSAGE_KEY_INFO: &[u8] = b"Nereus-Message-Keys";

/// Hash-ratchet chain key.
///
/// Advances by one HMAC step per message; each position yields the secrets
/// for exactly one message.
#[derive(Clone)]
pub(crate) struct ChainKey {
    pub(crate) key: MacKey,
    pub(crate) idx: u32,
}

impl ChainKey {
    pub(crate) fn new(key: MacKey, idx: u32) -> Self {
        Self { key, idx }
    }

    /// Advances the hash ratchet by one step.
    pub(crate) fn next(&self) -> ChainKey {
        ChainKey {
            key: MacKey::new(hmac_sha256(self.key.as_bytes(), &[0x01])),
            idx: self.idx.wrapping_add(1),
        }
    }

    /// Derives the secrets protecting the message at this chain position.
    pub(crate) fn message_keys(&self) -> MessageKeys {
        let mut base = hmac_sha256(self.key.as_bytes(), &[0x00]);
        let mut okm = [0u8; 76];
        hkdf_sha256(None, base.as_slice(), MESSAGE_KEY_INFO, &mut okm);
        base.zeroize();

        let mut cipher = Box::new([0u8; 32]);
        cipher.copy_from_slice(&okm[0..32]);
        let mut mac = Box::new([0u8; 32]);
        mac.copy_from_slice(&okm[32..64]);
        let mut nonce = Box::new([0u8; 12]);
        nonce.copy_from_slice(&okm[64..76]);
        okm.zeroize();

        MessageKeys {
            cipher_key: CipherKey::new(cipher, nonce),
            mac_key: MacKey::new(mac),
            counter: self.idx,
        }
    }
}

impl Zeroize for ChainKey {
    fn zeroize(&mut self) {
        self.key.zeroize();
        self.idx = 0;
    }
}

impl ZeroizeOnDrop for ChainKey {}

/// Per-message secrets derived from one chain position.
#[derive(Clone)]
pub(crate) struct MessageKeys {
    pub(crate) cipher_key: CipherKey,
    pub(crate) mac_key: MacKey,
    pub(crate) counter: u32,
}

impl MessageKeys {
    pub(crate) fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.cipher_key.encrypt(plaintext)
    }

    pub(crate) fn decrypt(&self, cipher_text: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.cipher_key.decrypt(cipher_text)
    }

    pub(crate) fn mac_key(&self) -> &MacKey {
        &self.mac_key
    }
}

impl Zeroize for MessageKeys {
    fn zeroize(&mut self) {
        self.cipher_key.zeroize();
        self.mac_key.zeroize();
        self.counter = 0;
    }
}

impl ZeroizeOnDrop for MessageKeys {}

/// Sending side of a ratchet branch.
#[derive(Clone)]
pub(crate) struct SendChain {
    pub(crate) chain_key: ChainKey,
    pub(crate) ratchet_key: KeyPair,
}

impl SendChain {
    pub(crate) fn new(chain_key: ChainKey, ratchet_key: KeyPair) -> Self {
        Self {
            chain_key,
            ratchet_key,
        }
    }
}

impl Zeroize for SendChain {
    fn zeroize(&mut self) {
        self.chain_key.zeroize();
        self.ratchet_key.zeroize();
    }
}

impl ZeroizeOnDrop for SendChain {}

/// Receiving chain with retained out-of-order message keys.
///
/// The chain is identified by the remote ratchet key it was derived from;
/// keys skipped over on the way to a later counter are kept (oldest first)
/// so earlier messages can still arrive.
#[derive(Clone)]
pub(crate) struct RecvChain {
    pub(crate) chain_key: ChainKey,
    pub(crate) ratchet_key: PublicKey,
    pub(crate) message_keys: VecDeque<MessageKeys>,
}

impl RecvChain {
    pub(crate) fn new(chain_key: ChainKey, ratchet_key: PublicKey) -> Self {
        Self {
            chain_key,
            ratchet_key,
            message_keys: VecDeque::new(),
        }
    }

    /// Takes the retained key for an old counter.
    pub(crate) fn try_message_keys(&mut self, counter: u32) -> Result<MessageKeys, SessionError> {
        if let Some(first) = self.message_keys.front() {
            if counter < first.counter {
                return Err(SessionError::OutdatedMessage);
            }
        }

        let pos = self
            .message_keys
            .iter()
            .position(|keys| keys.counter == counter)
            .ok_or(SessionError::DuplicateMessage)?;

        Ok(self
            .message_keys
            .remove(pos)
            .expect("retained message key must exist"))
    }

    /// Derives the keys for `counter`, staging everything skipped on the
    /// way there. Nothing is stored until [`Self::commit_message_keys`].
    pub(crate) fn stage_message_keys(
        &self,
        counter: u32,
    ) -> Result<(ChainKey, MessageKeys, Vec<MessageKeys>), SessionError> {
        let gap = counter - self.chain_key.idx;
        if gap as usize > MAX_COUNTER_GAP {
            return Err(SessionError::TooDistantFuture);
        }

        let mut staged = Vec::with_capacity(gap as usize);
        let mut chain_key = self.chain_key.clone();
        for _ in 0..gap {
            staged.push(chain_key.message_keys());
            chain_key = chain_key.next();
        }

        let keys = chain_key.message_keys();
        Ok((chain_key, keys, staged))
    }

    /// Stores staged keys after a successful decrypt, dropping the oldest
    /// beyond the retention bound.
    pub(crate) fn commit_message_keys(&mut self, staged: Vec<MessageKeys>) {
        for keys in staged {
            self.message_keys.push_back(keys);
        }
        while self.message_keys.len() > MAX_COUNTER_GAP {
            self.message_keys.pop_front();
        }
    }
}

impl Zeroize for RecvChain {
    fn zeroize(&mut self) {
        self.chain_key.zeroize();
        for keys in self.message_keys.iter_mut() {
            keys.zeroize();
        }
        self.message_keys.clear();
    }
}

impl ZeroizeOnDrop for RecvChain {}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_key() -> ChainKey {
        ChainKey::new(MacKey::new(Box::new([1u8; 32])), 0)
    }

    #[test]
    fn test_chain_advances() {
        let first = chain_key();
        let second = first.next();

        assert_eq!(second.idx, 1);
        assert_ne!(first.key.as_bytes(), second.key.as_bytes());
    }

    #[test]
    fn test_message_keys_differ_per_position() {
        let first = chain_key();
        let second = first.next();

        let a = first.message_keys();
        let b = second.message_keys();

        assert_ne!(a.mac_key.as_bytes(), b.mac_key.as_bytes());
        assert_eq!(a.counter, 0);
        assert_eq!(b.counter, 1);
    }

    #[test]
    fn test_staging_respects_gap_limit() {
        let chain = RecvChain::new(chain_key(), PublicKey::from([2u8; 32]));

        assert!(chain.stage_message_keys(MAX_COUNTER_GAP as u32).is_ok());
        assert!(matches!(
            chain.stage_message_keys(MAX_COUNTER_GAP as u32 + 1),
            Err(SessionError::TooDistantFuture)
        ));
    }

    #[test]
    fn test_retained_keys_are_single_use() {
        let mut chain = RecvChain::new(chain_key(), PublicKey::from([2u8; 32]));

        let (chain_key, _, staged) = chain.stage_message_keys(2).unwrap();
        chain.chain_key = chain_key.next();
        chain.commit_message_keys(staged);

        assert!(chain.try_message_keys(1).is_ok());
        assert!(matches!(
            chain.try_message_keys(1),
            Err(SessionError::DuplicateMessage)
        ));
    }

    #[test]
    fn test_dropped_keys_are_reported_outdated() {
        let mut chain = RecvChain::new(chain_key(), PublicKey::from([2u8; 32]));

        let (chain_key, _, staged) = chain.stage_message_keys(1).unwrap();
        chain.chain_key = chain_key.next();
        chain.commit_message_keys(staged);

        // drop the retained key for counter 0
        let _ = chain.try_message_keys(0).unwrap();
        chain.message_keys.push_back(chain.chain_key.message_keys());

        assert!(matches!(
            chain.try_message_keys(1),
            Err(SessionError::OutdatedMessage)
        ));
    }
}
