//! Encrypted Content-Encoding for HTTP, `aes128gcm` (RFC 8188).
//!
//! Output layout:
//!
//! ```text
//! salt (16) | rs (u32 BE) | idlen (u8) | keyid (idlen) | record 0 | record 1 | ...
//! ```
//!
//! Every record is at most `rs` bytes of AES-128-GCM ciphertext. The
//! plaintext of a record is its data followed by a delimiter: `0x02` on the
//! final record, `0x01` on all others.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::{Error, Result};

/// Record size used for every outbound push message.
pub const RECORD_SIZE: u32 = 32768;

pub const SALT_LEN: usize = 16;
const TAG_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 16;
const HEADER_FIXED_LEN: usize = SALT_LEN + 4 + 1;

/// Tag plus the delimiter byte.
const RECORD_OVERHEAD: usize = TAG_LEN + 1;
const MIN_RECORD_SIZE: u32 = RECORD_OVERHEAD as u32 + 1;

const CEK_INFO: &[u8] = b"Content-Encoding: aes128gcm\0";
const NONCE_INFO: &[u8] = b"Content-Encoding: nonce\0";

const DELIMITER: u8 = 0x01;
const LAST_DELIMITER: u8 = 0x02;

struct RecordKeys {
    cipher: Aes128Gcm,
    nonce_base: [u8; NONCE_LEN],
}

impl RecordKeys {
    fn derive(ikm: &[u8], salt: &[u8]) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(Some(salt), ikm);

        let mut cek = [0u8; KEY_LEN];
        hk.expand(CEK_INFO, &mut cek)
            .map_err(|_| Error::KeyDerivation)?;
        let mut nonce_base = [0u8; NONCE_LEN];
        hk.expand(NONCE_INFO, &mut nonce_base)
            .map_err(|_| Error::KeyDerivation)?;

        let cipher = Aes128Gcm::new_from_slice(&cek).map_err(|_| Error::KeyDerivation)?;

        Ok(RecordKeys { cipher, nonce_base })
    }

    /// Nonce base XOR the 96-bit big-endian record sequence number.
    fn nonce(&self, seq: u64) -> [u8; NONCE_LEN] {
        let mut nonce = self.nonce_base;
        for (byte, s) in nonce[NONCE_LEN - 8..].iter_mut().zip(seq.to_be_bytes()) {
            *byte ^= s;
        }
        nonce
    }
}

/// A parsed content-coding header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header<'a> {
    pub salt: [u8; SALT_LEN],
    pub record_size: u32,
    pub key_id: &'a [u8],
}

/// Splits `data` into its header and the record stream that follows.
pub fn parse_header(data: &[u8]) -> Result<(Header<'_>, &[u8])> {
    if data.len() < HEADER_FIXED_LEN {
        return Err(Error::MalformedHeader("truncated header"));
    }

    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&data[..SALT_LEN]);
    let mut rs = [0u8; 4];
    rs.copy_from_slice(&data[SALT_LEN..SALT_LEN + 4]);
    let record_size = u32::from_be_bytes(rs);
    let id_len = data[SALT_LEN + 4] as usize;

    if record_size < MIN_RECORD_SIZE {
        return Err(Error::MalformedHeader("record size too small"));
    }
    let rest = &data[HEADER_FIXED_LEN..];
    if rest.len() < id_len {
        return Err(Error::MalformedHeader("truncated key id"));
    }
    let (key_id, records) = rest.split_at(id_len);

    Ok((
        Header {
            salt,
            record_size,
            key_id,
        },
        records,
    ))
}

/// Encrypts `plaintext` into a complete `aes128gcm` body.
///
/// Every record, including a lone record for a short or empty plaintext,
/// reserves one byte for its delimiter.
pub fn encode(
    plaintext: &[u8],
    key_id: &[u8],
    ikm: &[u8],
    salt: &[u8; SALT_LEN],
    record_size: u32,
) -> Result<Vec<u8>> {
    if record_size < MIN_RECORD_SIZE {
        return Err(Error::MalformedHeader("record size too small"));
    }
    let id_len = u8::try_from(key_id.len())
        .map_err(|_| Error::MalformedHeader("key id longer than 255 bytes"))?;

    let keys = RecordKeys::derive(ikm, salt)?;
    let chunk_len = record_size as usize - RECORD_OVERHEAD;

    let chunks: Vec<&[u8]> = if plaintext.is_empty() {
        vec![plaintext]
    } else {
        plaintext.chunks(chunk_len).collect()
    };

    let mut out = Vec::with_capacity(
        HEADER_FIXED_LEN + key_id.len() + plaintext.len() + chunks.len() * RECORD_OVERHEAD,
    );
    out.extend_from_slice(salt);
    out.extend_from_slice(&record_size.to_be_bytes());
    out.push(id_len);
    out.extend_from_slice(key_id);

    let last = chunks.len() - 1;
    for (seq, chunk) in chunks.into_iter().enumerate() {
        let mut record = Vec::with_capacity(chunk.len() + 1);
        record.extend_from_slice(chunk);
        record.push(if seq == last { LAST_DELIMITER } else { DELIMITER });

        let nonce = keys.nonce(seq as u64);
        let sealed = keys
            .cipher
            .encrypt(&Nonce::from(nonce), record.as_slice())
            .map_err(|_| Error::Encryption)?;
        out.extend_from_slice(&sealed);
    }

    Ok(out)
}

/// Decrypts an `aes128gcm` body, authenticating every record.
pub fn decode(data: &[u8], ikm: &[u8]) -> Result<Vec<u8>> {
    let (header, records) = parse_header(data)?;
    if records.is_empty() {
        return Err(Error::Decryption("no records"));
    }

    let keys = RecordKeys::derive(ikm, &header.salt)?;
    let records: Vec<&[u8]> = records.chunks(header.record_size as usize).collect();
    let last = records.len() - 1;

    let mut plaintext = Vec::new();
    for (seq, record) in records.into_iter().enumerate() {
        if record.len() <= TAG_LEN {
            return Err(Error::Decryption("truncated record"));
        }

        let nonce = keys.nonce(seq as u64);
        let opened = keys
            .cipher
            .decrypt(&Nonce::from(nonce), record)
            .map_err(|_| Error::Decryption("authentication failed"))?;

        // Trailing zeros are padding; the last non-zero byte is the delimiter.
        let delimiter_at = opened
            .iter()
            .rposition(|&b| b != 0)
            .ok_or(Error::Decryption("missing delimiter"))?;
        let expected = if seq == last { LAST_DELIMITER } else { DELIMITER };
        if opened[delimiter_at] != expected {
            return Err(Error::Decryption("unexpected delimiter"));
        }

        plaintext.extend_from_slice(&opened[..delimiter_at]);
    }

    Ok(plaintext)
}
