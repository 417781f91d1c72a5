//! LoRaWAN cryptographic operations
//!
//! Session-key derivation, FRMPayload encryption and message integrity
//! codes for LoRaWAN 1.0.x. MICs use AES-CMAC; payload encryption is the
//! A-block counter scheme from the specification. Join-accepts are
//! decrypted on the device by *encrypting* the ciphertext, mirroring the
//! server which applies the AES decrypt operation when sending.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::MIC_SIZE;

/// Block size for AES-128
const BLOCK_SIZE: usize = 16;

/// A 128-bit AES key (AppKey or session key), serialized as 32 hex chars.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AesKey(#[serde(with = "hex_key")] pub [u8; 16]);

impl AesKey {
    pub fn new(bytes: [u8; 16]) -> Self {
        AesKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Debug for AesKey {
    // Keys never reach logs in clear text.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AesKey(****)")
    }
}

mod hex_key {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 16], D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom("expected 16 key bytes"))
    }
}

/// Direction identifiers for cryptographic operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Uplink (device to network)
    Up = 0,
    /// Downlink (network to device)
    Down = 1,
}

fn cipher_for(key: &AesKey) -> Aes128 {
    // 16-byte keys cannot fail construction
    Aes128::new_from_slice(key.as_bytes()).expect("AES-128 key size")
}

/// Encrypt or decrypt an FRMPayload with the A-block counter scheme.
///
/// The operation is an XOR stream and therefore its own inverse. FPort 0
/// payloads use the NwkSKey, application ports the AppSKey.
pub fn encrypt_frm_payload(
    key: &AesKey,
    dev_addr: u32,
    fcnt: u32,
    dir: Direction,
    payload: &[u8],
) -> Vec<u8> {
    let cipher = cipher_for(key);
    let mut result = Vec::with_capacity(payload.len());

    let blocks = payload.len().div_ceil(BLOCK_SIZE);
    for i in 0..blocks {
        let mut a = [0u8; BLOCK_SIZE];
        a[0] = 0x01;
        a[5] = dir as u8;
        a[6..10].copy_from_slice(&dev_addr.to_le_bytes());
        a[10..14].copy_from_slice(&fcnt.to_le_bytes());
        a[15] = (i + 1) as u8;

        cipher.encrypt_block((&mut a).into());

        let start = i * BLOCK_SIZE;
        let end = (start + BLOCK_SIZE).min(payload.len());
        for j in start..end {
            result.push(payload[j] ^ a[j - start]);
        }
    }

    result
}

/// MIC over a data frame (MHDR..FRMPayload) with the B0 block prefix.
pub fn compute_data_mic(
    key: &AesKey,
    msg: &[u8],
    dev_addr: u32,
    fcnt: u32,
    dir: Direction,
) -> [u8; MIC_SIZE] {
    let mut b0 = [0u8; BLOCK_SIZE];
    b0[0] = 0x49;
    b0[5] = dir as u8;
    b0[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    b0[10..14].copy_from_slice(&fcnt.to_le_bytes());
    b0[15] = msg.len() as u8;

    let mut mac =
        <Cmac<Aes128> as Mac>::new_from_slice(key.as_bytes()).expect("AES-128 key size");
    mac.update(&b0);
    mac.update(msg);
    truncate_mic(&mac.finalize().into_bytes())
}

/// MIC over a join-request or join-accept (plain CMAC, no B0 block).
pub fn compute_join_mic(key: &AesKey, msg: &[u8]) -> [u8; MIC_SIZE] {
    let mut mac =
        <Cmac<Aes128> as Mac>::new_from_slice(key.as_bytes()).expect("AES-128 key size");
    mac.update(msg);
    truncate_mic(&mac.finalize().into_bytes())
}

fn truncate_mic(tag: &[u8]) -> [u8; MIC_SIZE] {
    let mut mic = [0u8; MIC_SIZE];
    mic.copy_from_slice(&tag[..MIC_SIZE]);
    mic
}

/// Recover join-accept clear text on the device side.
///
/// The server applies aes128_decrypt when encrypting, so the device
/// applies aes128_encrypt block-wise to invert it.
pub fn decrypt_join_accept(key: &AesKey, encrypted: &[u8]) -> Vec<u8> {
    let cipher = cipher_for(key);
    let mut result = Vec::with_capacity(encrypted.len());
    for chunk in encrypted.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block[..chunk.len()].copy_from_slice(chunk);
        cipher.encrypt_block((&mut block).into());
        result.extend_from_slice(&block[..chunk.len()]);
    }
    result
}

/// Server-side join-accept encryption (used by canned bridges in tests).
pub fn encrypt_join_accept(key: &AesKey, clear: &[u8]) -> Vec<u8> {
    let cipher = cipher_for(key);
    let mut result = Vec::with_capacity(clear.len());
    for chunk in clear.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block[..chunk.len()].copy_from_slice(chunk);
        cipher.decrypt_block((&mut block).into());
        result.extend_from_slice(&block[..chunk.len()]);
    }
    result
}

/// Derive network and application session keys from join-accept material.
///
/// NwkSKey = aes128_encrypt(AppKey, 0x01 | JoinNonce | NetID | DevNonce | pad)
/// AppSKey = aes128_encrypt(AppKey, 0x02 | JoinNonce | NetID | DevNonce | pad)
pub fn derive_session_keys(
    app_key: &AesKey,
    join_nonce: &[u8; 3],
    net_id: &[u8; 3],
    dev_nonce: u16,
) -> (AesKey, AesKey) {
    let cipher = cipher_for(app_key);

    let mut derive = |tag: u8| {
        let mut block = [0u8; BLOCK_SIZE];
        block[0] = tag;
        block[1..4].copy_from_slice(join_nonce);
        block[4..7].copy_from_slice(net_id);
        block[7..9].copy_from_slice(&dev_nonce.to_le_bytes());
        cipher.encrypt_block((&mut block).into());
        AesKey::new(block)
    };

    (derive(0x01), derive(0x02))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> AesKey {
        AesKey::new([
            0x2B, 0x7E, 0x15, 0x16, 0x28, 0xAE, 0xD2, 0xA6, 0xAB, 0xF7, 0x15, 0x88, 0x09, 0xCF,
            0x4F, 0x3C,
        ])
    }

    #[test]
    fn frm_payload_encryption_is_involutive() {
        let payload = [0x01, 0x02, 0x03, 0x04, 0x05];
        let cipher = encrypt_frm_payload(&key(), 0x2601_1234, 7, Direction::Up, &payload);
        assert_ne!(cipher, payload);
        let clear = encrypt_frm_payload(&key(), 0x2601_1234, 7, Direction::Up, &cipher);
        assert_eq!(clear, payload);
    }

    #[test]
    fn join_accept_encryption_round_trips() {
        let clear: Vec<u8> = (0..16).collect();
        let wire = encrypt_join_accept(&key(), &clear);
        assert_eq!(decrypt_join_accept(&key(), &wire), clear);
    }

    #[test]
    fn session_keys_are_deterministic_and_distinct() {
        let (nwk_a, app_a) = derive_session_keys(&key(), &[1, 2, 3], &[4, 5, 6], 0xABCD);
        let (nwk_b, app_b) = derive_session_keys(&key(), &[1, 2, 3], &[4, 5, 6], 0xABCD);
        assert_eq!(nwk_a, nwk_b);
        assert_eq!(app_a, app_b);
        assert_ne!(nwk_a, app_a);
    }

    #[test]
    fn data_mic_depends_on_direction() {
        let msg = b"payload";
        let up = compute_data_mic(&key(), msg, 1, 1, Direction::Up);
        let down = compute_data_mic(&key(), msg, 1, 1, Direction::Down);
        assert_ne!(up, down);
    }
}
