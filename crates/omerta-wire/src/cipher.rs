//! Network-key envelope cipher
//!
//! Every datagram is sealed with ChaCha20-Poly1305 under the shared
//! 32-byte network key before it touches the socket. The nonce is random
//! per message and travels as a 12-byte prefix of the ciphertext blob.
//! A failed open means the sender is not on our network (or the datagram
//! was damaged); callers drop such datagrams silently.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use omerta_core::NETWORK_KEY_SIZE;

use crate::error::{WireError, WireResult};

/// Nonce length for ChaCha20-Poly1305
const NONCE_SIZE: usize = 12;

/// Symmetric cipher bound to one network key
#[derive(Clone)]
pub struct MessageCipher {
    cipher: ChaCha20Poly1305,
}

impl MessageCipher {
    /// Build a cipher from the shared network key
    pub fn new(key: &[u8; NETWORK_KEY_SIZE]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Encrypt envelope bytes for transmission
    pub fn seal(&self, plaintext: &[u8]) -> WireResult<Vec<u8>> {
        let nonce_bytes: [u8; NONCE_SIZE] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| WireError::DecryptFailed)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a received datagram
    pub fn open(&self, data: &[u8]) -> WireResult<Vec<u8>> {
        if data.len() < NONCE_SIZE {
            return Err(WireError::DecryptFailed);
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| WireError::DecryptFailed)
    }
}

impl std::fmt::Debug for MessageCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageCipher(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = MessageCipher::new(&[7u8; 32]);
        let sealed = cipher.seal(b"over the wire").unwrap();
        assert_ne!(&sealed[NONCE_SIZE..], b"over the wire");
        assert_eq!(cipher.open(&sealed).unwrap(), b"over the wire");
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = MessageCipher::new(&[1u8; 32]);
        let b = MessageCipher::new(&[2u8; 32]);
        let sealed = a.seal(b"secret").unwrap();
        assert!(matches!(b.open(&sealed), Err(WireError::DecryptFailed)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = MessageCipher::new(&[3u8; 32]);
        let mut sealed = cipher.seal(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(cipher.open(&sealed).is_err());
    }

    #[test]
    fn test_short_input_fails() {
        let cipher = MessageCipher::new(&[4u8; 32]);
        assert!(cipher.open(&[0u8; 5]).is_err());
        assert!(cipher.open(&[]).is_err());
    }

    #[test]
    fn test_nonces_are_unique() {
        let cipher = MessageCipher::new(&[5u8; 32]);
        let a = cipher.seal(b"same plaintext").unwrap();
        let b = cipher.seal(b"same plaintext").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
    }
}
