//! Binary block framing.
//!
//! Every binary transfer is preceded by a 12-byte little-endian header of
//! three 32-bit words: signature (with item size and flags), length, checksum.
//!
//! | Mode   | Signature word                 | Length unit     | Checksum over   |
//! |--------|--------------------------------|-----------------|-----------------|
//! | DEEP   | `0xa5a50000 \| itemsize \| flags` | elements        | elements        |
//! | IcePAP | `0xa5aa555a`                   | 16-bit words    | 16-bit words    |

use crate::error::{IcepapError, Result};
use tracing::debug;

/// DEEP signature (upper 16 bits of word 0).
pub const DEEP_SIGNATURE: u32 = 0xa5a5_0000;
/// IcePAP signature (whole word 0).
pub const ICEPAP_SIGNATURE: u32 = 0xa5aa_555a;
/// Mask selecting the DEEP signature bits.
pub const SIGNATURE_MASK: u32 = 0xffff_0000;
/// Flag: the sender did not compute a checksum.
pub const FLAG_NO_CHECKSUM: u32 = 0x0000_0010;
/// Flag: data is big-endian.
pub const FLAG_BIG_ENDIAN: u32 = 0x0000_0020;
/// Mask selecting the item size in bytes.
pub const ITEM_SIZE_MASK: u32 = 0x0000_000f;
/// Header length on the wire.
pub const HEADER_LEN: usize = 12;

/// Wire dialect spoken by a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolMode {
    /// Native DEEP protocol: strict reply prefixes, typed binary blocks.
    Deep,
    /// IcePAP compatibility: addressed prefixes, 16-bit binary blocks.
    #[default]
    IcePap,
}

impl ProtocolMode {
    /// Liveness probe command.
    pub fn ping_command(&self) -> &'static str {
        match self {
            ProtocolMode::Deep => "?PING",
            ProtocolMode::IcePap => "?_SOCKPING",
        }
    }

    /// Whether reply prefixes include the `<address>:` field.
    pub fn echoes_address(&self) -> bool {
        matches!(self, ProtocolMode::IcePap)
    }
}

impl std::str::FromStr for ProtocolMode {
    type Err = IcepapError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "deep" => Ok(ProtocolMode::Deep),
            "icepap" => Ok(ProtocolMode::IcePap),
            other => Err(IcepapError::InvalidOption(format!("invalid communication mode: \"{}\"", other))),
        }
    }
}

/// A typed block of binary values, stored as little-endian bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryBlock {
    item_size: usize,
    bytes: Vec<u8>,
}

impl BinaryBlock {
    /// Wrap little-endian `bytes` holding items of `item_size` bytes (1, 2, 4 or 8).
    pub fn from_le_bytes(item_size: usize, bytes: Vec<u8>) -> Result<Self> {
        if !matches!(item_size, 1 | 2 | 4 | 8) {
            return Err(IcepapError::protocol("", "", format!("unsupported item size: {} bytes", item_size)));
        }
        if bytes.len() % item_size != 0 {
            return Err(IcepapError::protocol(
                "",
                "",
                format!("{} bytes is not a multiple of item size {}", bytes.len(), item_size),
            ));
        }
        Ok(Self { item_size, bytes })
    }

    /// Block of 16-bit words.
    pub fn from_u16(values: &[u16]) -> Self {
        Self {
            item_size: 2,
            bytes: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    /// Block of 32-bit words.
    pub fn from_u32(values: &[u32]) -> Self {
        Self {
            item_size: 4,
            bytes: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    /// Bytes per item.
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.bytes.len() / self.item_size
    }

    /// Whether the block holds no items.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Little-endian bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume into little-endian bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Item values widened to `u64`.
    pub fn values(&self) -> impl Iterator<Item = u64> + '_ {
        self.bytes.chunks_exact(self.item_size).map(|chunk| {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            u64::from_le_bytes(word)
        })
    }

    /// Sum of items, truncated to 32 bits.
    pub fn checksum(&self) -> u32 {
        self.values().fold(0u32, |acc, v| acc.wrapping_add(v as u32))
    }

    /// Sum of the data reinterpreted as little-endian 16-bit words, truncated to 32 bits.
    pub fn checksum_u16(&self) -> u32 {
        self.bytes
            .chunks_exact(2)
            .fold(0u32, |acc, w| acc.wrapping_add(u32::from(u16::from_le_bytes([w[0], w[1]]))))
    }
}

/// Decoded 12-byte binary header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryHeader {
    /// Bytes per item.
    pub item_size: usize,
    /// Number of items to follow.
    pub count: usize,
    /// Announced checksum.
    pub checksum: u32,
    /// Whether the checksum must be verified.
    pub checksum_present: bool,
    /// Whether the data is big-endian.
    pub big_endian: bool,
}

impl BinaryHeader {
    /// Payload length in bytes.
    pub fn payload_len(&self) -> usize {
        self.item_size * self.count
    }
}

/// Encode the header and payload for an upload.
pub fn encode_upload(mode: ProtocolMode, block: &BinaryBlock) -> Result<([u8; HEADER_LEN], Vec<u8>)> {
    let (word0, length, checksum) = match mode {
        ProtocolMode::Deep => (
            DEEP_SIGNATURE | (block.item_size() as u32 & ITEM_SIZE_MASK),
            block.len() as u32,
            block.checksum(),
        ),
        ProtocolMode::IcePap => {
            if block.as_bytes().len() % 2 != 0 {
                return Err(IcepapError::protocol(
                    "",
                    "",
                    "IcePAP binary blocks must hold a whole number of 16-bit words",
                ));
            }
            (ICEPAP_SIGNATURE, (block.as_bytes().len() / 2) as u32, block.checksum_u16())
        }
    };
    debug!(
        header = format_args!("0x{:08x}", word0),
        length = format_args!("0x{:08x}", length),
        checksum = format_args!("0x{:08x}", checksum),
        "binary upload header"
    );
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&word0.to_le_bytes());
    header[4..8].copy_from_slice(&length.to_le_bytes());
    header[8..12].copy_from_slice(&checksum.to_le_bytes());
    Ok((header, block.as_bytes().to_vec()))
}

/// Decode and validate a download header.
pub fn decode_header(mode: ProtocolMode, raw: &[u8; HEADER_LEN]) -> std::result::Result<BinaryHeader, String> {
    let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
    let (word0, length, checksum) = (word(0), word(4), word(8));
    debug!(
        header = format_args!("0x{:08x}", word0),
        length = format_args!("0x{:08x}", length),
        checksum = format_args!("0x{:08x}", checksum),
        "binary download header"
    );

    match mode {
        ProtocolMode::Deep => {
            if word0 & SIGNATURE_MASK != DEEP_SIGNATURE {
                return Err(format!("bad binary data header 0x{:08x}", word0));
            }
            let item_size = (word0 & ITEM_SIZE_MASK) as usize;
            if !matches!(item_size, 1 | 2 | 4 | 8) {
                return Err(format!("unsupported binary item size {}", item_size));
            }
            Ok(BinaryHeader {
                item_size,
                count: length as usize,
                checksum,
                checksum_present: word0 & FLAG_NO_CHECKSUM == 0,
                big_endian: word0 & FLAG_BIG_ENDIAN != 0,
            })
        }
        ProtocolMode::IcePap => {
            if word0 != ICEPAP_SIGNATURE {
                return Err(format!("bad IcePAP binary data header 0x{:08x}", word0));
            }
            Ok(BinaryHeader {
                item_size: 2,
                count: length as usize,
                checksum,
                checksum_present: true,
                big_endian: false,
            })
        }
    }
}

/// Normalise a downloaded payload to little-endian and verify its checksum.
///
/// On mismatch returns `(announced, computed)`.
pub fn decode_payload(header: &BinaryHeader, mut payload: Vec<u8>) -> std::result::Result<BinaryBlock, (u32, u32)> {
    if header.big_endian {
        for item in payload.chunks_exact_mut(header.item_size) {
            item.reverse();
        }
    }
    let block = BinaryBlock {
        item_size: header.item_size,
        bytes: payload,
    };
    let computed = block.checksum();
    if header.checksum_present && computed != header.checksum {
        return Err((header.checksum, computed));
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_header_layout() {
        let block = BinaryBlock::from_u32(&[1, 2, 3]);
        let (header, payload) = encode_upload(ProtocolMode::Deep, &block).unwrap();
        assert_eq!(&header[0..4], &0xa5a5_0004u32.to_le_bytes());
        assert_eq!(&header[4..8], &3u32.to_le_bytes());
        assert_eq!(&header[8..12], &6u32.to_le_bytes());
        assert_eq!(payload.len(), 12);
    }

    #[test]
    fn icepap_header_counts_words() {
        let block = BinaryBlock::from_u32(&[0x0001_0002]);
        let (header, _) = encode_upload(ProtocolMode::IcePap, &block).unwrap();
        assert_eq!(&header[0..4], &ICEPAP_SIGNATURE.to_le_bytes());
        assert_eq!(&header[4..8], &2u32.to_le_bytes());
        // 0x0002 + 0x0001
        assert_eq!(&header[8..12], &3u32.to_le_bytes());
    }

    #[test]
    fn icepap_rejects_odd_length() {
        let block = BinaryBlock::from_le_bytes(1, vec![1, 2, 3]).unwrap();
        assert!(encode_upload(ProtocolMode::IcePap, &block).is_err());
    }

    #[test]
    fn big_endian_download_is_swapped() {
        let mut raw = [0u8; HEADER_LEN];
        raw[0..4].copy_from_slice(&(DEEP_SIGNATURE | FLAG_BIG_ENDIAN | 2).to_le_bytes());
        raw[4..8].copy_from_slice(&2u32.to_le_bytes());
        raw[8..12].copy_from_slice(&0x0102u32.wrapping_add(0x0304).to_le_bytes());
        let header = decode_header(ProtocolMode::Deep, &raw).unwrap();
        assert!(header.big_endian);

        let block = decode_payload(&header, vec![0x01, 0x02, 0x03, 0x04]).unwrap();
        assert_eq!(block.values().collect::<Vec<_>>(), vec![0x0102, 0x0304]);
    }

    #[test]
    fn checksum_mismatch_reported() {
        let mut raw = [0u8; HEADER_LEN];
        raw[0..4].copy_from_slice(&(DEEP_SIGNATURE | 1).to_le_bytes());
        raw[4..8].copy_from_slice(&2u32.to_le_bytes());
        raw[8..12].copy_from_slice(&99u32.to_le_bytes());
        let header = decode_header(ProtocolMode::Deep, &raw).unwrap();
        assert_eq!(decode_payload(&header, vec![1, 2]), Err((99, 3)));
    }

    #[test]
    fn no_checksum_flag_skips_verification() {
        let mut raw = [0u8; HEADER_LEN];
        raw[0..4].copy_from_slice(&(DEEP_SIGNATURE | FLAG_NO_CHECKSUM | 1).to_le_bytes());
        raw[4..8].copy_from_slice(&1u32.to_le_bytes());
        let header = decode_header(ProtocolMode::Deep, &raw).unwrap();
        assert!(decode_payload(&header, vec![7]).is_ok());
    }

    #[test]
    fn bad_signatures() {
        let raw = [0u8; HEADER_LEN];
        assert!(decode_header(ProtocolMode::Deep, &raw).is_err());
        assert!(decode_header(ProtocolMode::IcePap, &raw).is_err());
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("IcePAP".parse::<ProtocolMode>().unwrap(), ProtocolMode::IcePap);
        assert_eq!("deep".parse::<ProtocolMode>().unwrap(), ProtocolMode::Deep);
        assert!("serial".parse::<ProtocolMode>().is_err());
    }
}
