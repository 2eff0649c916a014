/// AES-CTR decryption of Victron advertisement records
use aes::cipher::{KeyIvInit, StreamCipher};
use log::trace;

use crate::error::DecodeError;
use crate::models::EncryptedRecord;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes192Ctr = ctr::Ctr128BE<aes::Aes192>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

pub const IV_LEN: usize = 16;

/// Decode the hex encoded pre-shared key
pub fn decode_key(key_hex: &str) -> Result<Vec<u8>, DecodeError> {
    let key = hex::decode(key_hex.trim())?;
    match key.len() {
        16 | 24 | 32 => Ok(key),
        len => Err(DecodeError::InvalidKeyLength(len)),
    }
}

/// Build the counter block: nonce restored to wire order at the front, zeros after
pub fn build_iv(record: &EncryptedRecord) -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    iv[0] = record.nonce[1];
    iv[1] = record.nonce[0];
    iv
}

/// Decrypt a record's ciphertext with the hex encoded pre-shared key
///
/// There is no authentication tag in the protocol. A wrong key or a corrupted
/// frame yields garbage of the same length instead of an error.
pub fn decrypt(record: &EncryptedRecord, key_hex: &str) -> Result<Vec<u8>, DecodeError> {
    let key = decode_key(key_hex)?;
    let iv = build_iv(record);
    trace!("decrypting with {}-bit key, iv {}", key.len() * 8, hex::encode(iv));

    let mut plaintext = record.ciphertext.clone();
    match key.len() {
        16 => apply_keystream::<Aes128Ctr>(&key, &iv, &mut plaintext)?,
        24 => apply_keystream::<Aes192Ctr>(&key, &iv, &mut plaintext)?,
        _ => apply_keystream::<Aes256Ctr>(&key, &iv, &mut plaintext)?,
    }

    trace!("plaintext: {}", hex::encode(&plaintext));
    Ok(plaintext)
}

fn apply_keystream<C: KeyIvInit + StreamCipher>(
    key: &[u8],
    iv: &[u8],
    buf: &mut [u8],
) -> Result<(), DecodeError> {
    let mut cipher =
        C::new_from_slices(key, iv).map_err(|_| DecodeError::InvalidKeyLength(key.len()))?;
    cipher.apply_keystream(buf);
    Ok(())
}
