/// Slicing of Victron "instant readout" advertisements into encrypted records
use log::trace;

use crate::error::DecodeError;
use crate::models::{EncryptedRecord, ManufacturerData};

// Victron protocol constants
pub const VICTRON_MANUFACTURER_ID: u16 = 0x02E1; // Victron Energy BV company identifier
pub const MIN_FRAME_LEN: usize = 20;
const RECORD_TYPE_OFFSET: usize = 4;
const NONCE_LOW_OFFSET: usize = 5;
const NONCE_HIGH_OFFSET: usize = 6;
const KEY_CHECK_OFFSET: usize = 7;
const CIPHERTEXT_OFFSET: usize = 8;

/// Pick the Victron payload out of an advertisement's manufacturer data
pub fn victron_payload(manufacturer_data: &ManufacturerData) -> Result<&[u8], DecodeError> {
    manufacturer_data
        .get(&VICTRON_MANUFACTURER_ID)
        .map(Vec::as_slice)
        .ok_or(DecodeError::MissingManufacturerData(VICTRON_MANUFACTURER_ID))
}

/// Decode a raw Victron advertisement payload into its encrypted record
///
/// Layout of the payload (company identifier already stripped):
/// - Bytes 0-3: Prefix, model id and readout type (ignored)
/// - Byte 4: Record type
/// - Bytes 5-6: Nonce / data counter, least significant byte first
/// - Byte 7: First byte of the encryption key
/// - Bytes 8..: AES-CTR ciphertext
///
/// The nonce is stored as `[byte 6, byte 5]`. The decryptor undoes this when
/// it builds the IV, and both halves must stay as they are to match the hardware.
pub fn decode_frame(raw: &[u8]) -> Result<EncryptedRecord, DecodeError> {
    trace!("raw advertisement data: {}", hex::encode(raw));

    if raw.len() < MIN_FRAME_LEN {
        return Err(DecodeError::FrameTooShort {
            expected: MIN_FRAME_LEN,
            actual: raw.len(),
        });
    }

    Ok(EncryptedRecord {
        record_type: raw[RECORD_TYPE_OFFSET],
        nonce: [raw[NONCE_HIGH_OFFSET], raw[NONCE_LOW_OFFSET]],
        key_check_byte: raw[KEY_CHECK_OFFSET],
        ciphertext: raw[CIPHERTEXT_OFFSET..].to_vec(),
    })
}
