//! AES-256-GCM session token codec (C6.7).
//!
//! Plaintext layout is fixed: `magic (8) || session_id (i64 BE) || handle_id
//! (i64 BE)`. The wire form is base64 of `nonce (12 random bytes) ||
//! ciphertext || tag`; AAD is the room's opaque nonce string, so a token
//! minted for one room's live-meta cannot be replayed against another.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;
use thiserror::Error;

const MAGIC: [u8; 8] = *b"jtokenv1";
const PLAINTEXT_LEN: usize = 8 + 8 + 8;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("token too short")]
    TokenTooShort,
    #[error("invalid prefix")]
    InvalidPrefix,
    #[error("key must be exactly 32 bytes")]
    InvalidKeyLength,
    #[error("failed to marshal token")]
    MarshalError,
}

/// Immutable once constructed; holds no state beyond the AEAD key.
pub struct TokenCodec {
    cipher: Aes256Gcm,
}

impl TokenCodec {
    pub fn new(key: &[u8]) -> Result<Self, TokenError> {
        if key.len() != 32 {
            return Err(TokenError::InvalidKeyLength);
        }
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| TokenError::InvalidKeyLength)?;
        Ok(Self { cipher })
    }

    /// Encode `(session_id, handle_id)` under AAD `room_nonce`.
    pub fn encode(&self, room_nonce: &str, session_id: i64, handle_id: i64) -> Result<String, TokenError> {
        let mut plaintext = Vec::with_capacity(PLAINTEXT_LEN);
        plaintext.extend_from_slice(&MAGIC);
        plaintext.extend_from_slice(&session_id.to_be_bytes());
        plaintext.extend_from_slice(&handle_id.to_be_bytes());

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: &plaintext,
                    aad: room_nonce.as_bytes(),
                },
            )
            .map_err(|_| TokenError::MarshalError)?;

        let mut wire = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        wire.extend_from_slice(&nonce_bytes);
        wire.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(wire))
    }

    /// Decode a wire token, verifying it was minted under AAD `room_nonce`.
    pub fn decode(&self, room_nonce: &str, token: &str) -> Result<(i64, i64), TokenError> {
        let raw = STANDARD.decode(token).map_err(|_| TokenError::TokenTooShort)?;
        if raw.len() <= NONCE_LEN {
            return Err(TokenError::TokenTooShort);
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: room_nonce.as_bytes(),
                },
            )
            .map_err(|_| TokenError::AuthenticationFailed)?;

        if plaintext.len() != PLAINTEXT_LEN {
            return Err(TokenError::TokenTooShort);
        }
        if plaintext[..8] != MAGIC {
            return Err(TokenError::InvalidPrefix);
        }
        let session_id = i64::from_be_bytes(plaintext[8..16].try_into().expect("checked length"));
        let handle_id = i64::from_be_bytes(plaintext[16..24].try_into().expect("checked length"));
        Ok((session_id, handle_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> TokenCodec {
        TokenCodec::new(&[7u8; 32]).unwrap()
    }

    #[test]
    fn round_trips_under_matching_aad() {
        let codec = codec();
        let token = codec.encode("room-nonce-abc", 123, 456).unwrap();
        assert_eq!(codec.decode("room-nonce-abc", &token).unwrap(), (123, 456));
    }

    #[test]
    fn rejects_mismatched_aad() {
        let codec = codec();
        let token = codec.encode("room-nonce-abc", 123, 456).unwrap();
        assert_eq!(
            codec.decode("different-nonce", &token),
            Err(TokenError::AuthenticationFailed)
        );
    }

    #[test]
    fn rejects_truncated_token() {
        let codec = codec();
        assert_eq!(codec.decode("n", "AAAA"), Err(TokenError::TokenTooShort));
    }

    #[test]
    fn rejects_garbage_base64() {
        let codec = codec();
        assert_eq!(codec.decode("n", "not base64!!"), Err(TokenError::TokenTooShort));
    }

    #[test]
    fn rejects_wrong_key_length() {
        assert_eq!(TokenCodec::new(&[1u8; 16]).unwrap_err(), TokenError::InvalidKeyLength);
    }

    #[test]
    fn rejects_forged_magic() {
        let cipher = Aes256Gcm::new_from_slice(&[7u8; 32]).unwrap();
        let mut plaintext = vec![0u8; 8];
        plaintext.extend_from_slice(&1i64.to_be_bytes());
        plaintext.extend_from_slice(&2i64.to_be_bytes());
        let nonce_bytes = [9u8; NONCE_LEN];
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: &plaintext, aad: b"n" })
            .unwrap();
        let mut wire = nonce_bytes.to_vec();
        wire.extend_from_slice(&ciphertext);
        let token = STANDARD.encode(wire);

        let codec = codec();
        assert_eq!(codec.decode("n", &token), Err(TokenError::InvalidPrefix));
    }
}
