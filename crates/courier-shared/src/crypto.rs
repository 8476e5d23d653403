//! Direct-message payload encryption (NIP-44 version 2).
//!
//! A conversation key is derived once per pair of identities from the ECDH
//! shared x-coordinate. Every message then draws a fresh 32-byte nonce, from
//! which ChaCha20 and HMAC-SHA256 keys are expanded. The payload is
//! `base64(version || nonce || ciphertext || mac)`, so it carries everything
//! the recipient needs besides the key.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::constants::{
    MAX_PLAINTEXT_SIZE, MIN_PLAINTEXT_SIZE, NIP44_MAC_SIZE, NIP44_NONCE_SIZE, NIP44_SALT,
    NIP44_VERSION,
};
use crate::error::CryptoError;
use crate::identity::Signer;
use crate::types::PublicKey;

pub type ConversationKey = [u8; 32];

type HmacSha256 = Hmac<Sha256>;

// Bounds on the base64 payload and on its decoded form
const MIN_PAYLOAD_LEN: usize = 132;
const MAX_PAYLOAD_LEN: usize = 87_472;
const MIN_DECODED_LEN: usize = 99;
const MAX_DECODED_LEN: usize = 65_603;

struct MessageKeys {
    chacha_key: [u8; 32],
    chacha_nonce: [u8; 12],
    hmac_key: [u8; 32],
}

/// Derive the symmetric key shared by `signer` and `counterparty`.
/// Both directions of a conversation yield the same key.
pub fn conversation_key(
    signer: &dyn Signer,
    counterparty: &PublicKey,
) -> Result<ConversationKey, CryptoError> {
    let shared_x = signer
        .derive_shared_secret(counterparty)
        .map_err(|e| CryptoError::KeyAgreement(e.to_string()))?;
    Ok(conversation_key_from_shared(&shared_x))
}

fn conversation_key_from_shared(shared_x: &[u8; 32]) -> ConversationKey {
    let (prk, _) = Hkdf::<Sha256>::extract(Some(NIP44_SALT), shared_x);
    let mut key = [0u8; 32];
    key.copy_from_slice(&prk);
    key
}

/// Encrypt `plaintext` for `counterparty`
pub fn encrypt(
    signer: &dyn Signer,
    counterparty: &PublicKey,
    plaintext: &str,
) -> Result<String, CryptoError> {
    let key = conversation_key(signer, counterparty)?;
    encrypt_with_key(&key, plaintext)
}

/// Decrypt a payload exchanged with `counterparty`
pub fn decrypt(
    signer: &dyn Signer,
    counterparty: &PublicKey,
    payload: &str,
) -> Result<String, CryptoError> {
    let key = conversation_key(signer, counterparty)?;
    decrypt_with_key(&key, payload)
}

pub fn encrypt_with_key(key: &ConversationKey, plaintext: &str) -> Result<String, CryptoError> {
    let mut nonce = [0u8; NIP44_NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    encrypt_with_nonce(key, &nonce, plaintext)
}

pub(crate) fn encrypt_with_nonce(
    key: &ConversationKey,
    nonce: &[u8; NIP44_NONCE_SIZE],
    plaintext: &str,
) -> Result<String, CryptoError> {
    let keys = message_keys(key, nonce)?;
    let mut buffer = pad(plaintext)?;

    let mut cipher = ChaCha20::new(&keys.chacha_key.into(), &keys.chacha_nonce.into());
    cipher.apply_keystream(&mut buffer);

    let mac = compute_mac(&keys.hmac_key, nonce, &buffer)?;

    let mut output = Vec::with_capacity(1 + NIP44_NONCE_SIZE + buffer.len() + NIP44_MAC_SIZE);
    output.push(NIP44_VERSION);
    output.extend_from_slice(nonce);
    output.extend_from_slice(&buffer);
    output.extend_from_slice(&mac);
    Ok(BASE64.encode(output))
}

pub fn decrypt_with_key(key: &ConversationKey, payload: &str) -> Result<String, CryptoError> {
    if payload.is_empty() {
        return Err(CryptoError::DecryptionFailed("empty payload".into()));
    }
    if payload.starts_with('#') {
        return Err(CryptoError::DecryptionFailed("unsupported encryption version".into()));
    }
    if !(MIN_PAYLOAD_LEN..=MAX_PAYLOAD_LEN).contains(&payload.len()) {
        return Err(CryptoError::DecryptionFailed(format!(
            "invalid payload length {}",
            payload.len()
        )));
    }

    let data = BASE64
        .decode(payload)
        .map_err(|e| CryptoError::DecryptionFailed(format!("invalid base64: {e}")))?;
    if !(MIN_DECODED_LEN..=MAX_DECODED_LEN).contains(&data.len()) {
        return Err(CryptoError::DecryptionFailed(format!(
            "invalid data length {}",
            data.len()
        )));
    }
    if data[0] != NIP44_VERSION {
        return Err(CryptoError::DecryptionFailed(format!(
            "unknown version {}",
            data[0]
        )));
    }

    let mut nonce = [0u8; NIP44_NONCE_SIZE];
    nonce.copy_from_slice(&data[1..1 + NIP44_NONCE_SIZE]);
    let mac_start = data.len() - NIP44_MAC_SIZE;
    let ciphertext = &data[1 + NIP44_NONCE_SIZE..mac_start];
    let mac = &data[mac_start..];

    let keys = message_keys(key, &nonce)?;
    verify_mac(&keys.hmac_key, &nonce, ciphertext, mac)?;

    let mut buffer = ciphertext.to_vec();
    let mut cipher = ChaCha20::new(&keys.chacha_key.into(), &keys.chacha_nonce.into());
    cipher.apply_keystream(&mut buffer);

    unpad(&buffer)
}

fn message_keys(
    key: &ConversationKey,
    nonce: &[u8; NIP44_NONCE_SIZE],
) -> Result<MessageKeys, CryptoError> {
    let hk = Hkdf::<Sha256>::from_prk(key)
        .map_err(|e| CryptoError::KeyAgreement(e.to_string()))?;
    let mut okm = [0u8; 76];
    hk.expand(nonce, &mut okm)
        .map_err(|e| CryptoError::KeyAgreement(e.to_string()))?;

    let mut keys = MessageKeys {
        chacha_key: [0u8; 32],
        chacha_nonce: [0u8; 12],
        hmac_key: [0u8; 32],
    };
    keys.chacha_key.copy_from_slice(&okm[0..32]);
    keys.chacha_nonce.copy_from_slice(&okm[32..44]);
    keys.hmac_key.copy_from_slice(&okm[44..76]);
    Ok(keys)
}

fn mac_for(hmac_key: &[u8; 32], nonce: &[u8], ciphertext: &[u8]) -> Result<HmacSha256, CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(hmac_key)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    mac.update(nonce);
    mac.update(ciphertext);
    Ok(mac)
}

fn compute_mac(hmac_key: &[u8; 32], nonce: &[u8], ciphertext: &[u8]) -> Result<[u8; 32], CryptoError> {
    let tag = mac_for(hmac_key, nonce, ciphertext)?.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&tag);
    Ok(out)
}

fn verify_mac(
    hmac_key: &[u8; 32],
    nonce: &[u8],
    ciphertext: &[u8],
    expected: &[u8],
) -> Result<(), CryptoError> {
    mac_for(hmac_key, nonce, ciphertext)?
        .verify_slice(expected)
        .map_err(|_| CryptoError::DecryptionFailed("invalid MAC".into()))
}

/// Size the plaintext is padded to before encryption
pub fn calc_padded_len(unpadded_len: usize) -> usize {
    if unpadded_len <= 32 {
        return 32;
    }
    let next_power = 1usize << (usize::BITS - (unpadded_len - 1).leading_zeros());
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * ((unpadded_len - 1) / chunk + 1)
}

fn pad(plaintext: &str) -> Result<Vec<u8>, CryptoError> {
    let bytes = plaintext.as_bytes();
    let len = bytes.len();
    if !(MIN_PLAINTEXT_SIZE..=MAX_PLAINTEXT_SIZE).contains(&len) {
        return Err(CryptoError::EncryptionFailed(format!(
            "plaintext length {len} out of range"
        )));
    }

    let padded_len = calc_padded_len(len);
    let mut out = Vec::with_capacity(2 + padded_len);
    out.extend_from_slice(&(len as u16).to_be_bytes());
    out.extend_from_slice(bytes);
    out.resize(2 + padded_len, 0);
    Ok(out)
}

fn unpad(padded: &[u8]) -> Result<String, CryptoError> {
    if padded.len() < 2 {
        return Err(CryptoError::DecryptionFailed("invalid padding".into()));
    }
    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if len < MIN_PLAINTEXT_SIZE
        || padded.len() < 2 + len
        || padded.len() != 2 + calc_padded_len(len)
    {
        return Err(CryptoError::DecryptionFailed("invalid padding".into()));
    }

    String::from_utf8(padded[2..2 + len].to_vec())
        .map_err(|_| CryptoError::DecryptionFailed("plaintext is not UTF-8".into()))
}
