//! Firmware vector layout used by `*PARDAT` trajectory downloads.
//!
//! Each column is one vector: a 24-byte little-endian header followed by the
//! values as `f64` and zero padding up to a 32-bit boundary. Vectors are
//! concatenated into one buffer.

use crate::error::{IcepapError, Result};
use crate::protocol::BinaryBlock;

/// Vector signature.
pub const SIGNATURE: u16 = 0xcafe;
/// Layout version.
pub const VERSION: u8 = 0;
/// Header length in bytes.
pub const HEADER_LEN: usize = 24;
/// Data type code of `f64` values.
pub const DTYPE_F64: u8 = 0x05;
/// Address carried by the parameter column.
pub const PARAMETER_ADDRESS: u16 = 255;
/// Maximum number of values in one vector.
pub const MAX_VALUES: usize = 0xffff;

const KIND_MASK: u16 = 0xf000;
const ADDRESS_MASK: u16 = 0x0fff;

/// Role of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Parameter range.
    Parameter,
    /// Axis positions.
    Position,
    /// Axis slopes.
    Slope,
}

impl ColumnKind {
    /// Flag bits of this kind.
    pub fn flag(self) -> u16 {
        match self {
            ColumnKind::Parameter => 0x1000,
            ColumnKind::Position => 0x2000,
            ColumnKind::Slope => 0x4000,
        }
    }

    fn from_flag(flag: u16) -> Option<Self> {
        match flag & KIND_MASK {
            0x1000 => Some(ColumnKind::Parameter),
            0x2000 => Some(ColumnKind::Position),
            0x4000 => Some(ColumnKind::Slope),
            _ => None,
        }
    }
}

/// One decoded vector.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorColumn {
    /// Column role.
    pub kind: ColumnKind,
    /// Axis address, or [`PARAMETER_ADDRESS`].
    pub address: u16,
    /// Values.
    pub values: Vec<f64>,
}

/// Concatenated vectors ready for download.
#[derive(Debug, Clone, Default)]
pub struct VectorData {
    bytes: Vec<u8>,
    columns: usize,
}

impl VectorData {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column.
    pub fn append(&mut self, values: &[f64], address: u16, kind: ColumnKind) -> Result<()> {
        if values.len() > MAX_VALUES {
            return Err(IcepapError::InvalidOption(format!(
                "{} values in one column, at most {} allowed",
                values.len(),
                MAX_VALUES
            )));
        }
        let data_len = values.len() * 8;
        let padding = (4 - data_len % 4) % 4;
        let words = (HEADER_LEN + data_len + padding) / 4;

        self.bytes.extend_from_slice(&SIGNATURE.to_le_bytes());
        self.bytes.push(VERSION);
        self.bytes.push((HEADER_LEN / 4) as u8);
        self.bytes.extend_from_slice(&(words as u32).to_le_bytes());
        self.bytes.extend_from_slice(&(values.len() as u32).to_le_bytes());
        self.bytes.push(DTYPE_F64);
        self.bytes.push(0); // no compression
        self.bytes.extend_from_slice(&(kind.flag() | (address & ADDRESS_MASK)).to_le_bytes());
        self.bytes.extend_from_slice(&0f64.to_le_bytes());
        for value in values {
            self.bytes.extend_from_slice(&value.to_le_bytes());
        }
        self.bytes.resize(self.bytes.len() + padding, 0);
        self.columns += 1;
        Ok(())
    }

    /// Number of vectors.
    pub fn columns(&self) -> usize {
        self.columns
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Binary block of 16-bit words, as downloaded to the controller.
    pub fn to_block(&self) -> Result<BinaryBlock> {
        BinaryBlock::from_le_bytes(2, self.bytes.clone())
    }

    /// Decode concatenated vectors.
    pub fn parse(bytes: &[u8]) -> Result<Vec<VectorColumn>> {
        let bad = |message: String| IcepapError::protocol("", "*PARDAT", message);
        let mut columns = Vec::new();
        let mut rest = bytes;
        while !rest.is_empty() {
            if rest.len() < HEADER_LEN {
                return Err(bad(format!("truncated vector header ({} bytes)", rest.len())));
            }
            let u16_at = |i: usize| u16::from_le_bytes([rest[i], rest[i + 1]]);
            let u32_at = |i: usize| u32::from_le_bytes([rest[i], rest[i + 1], rest[i + 2], rest[i + 3]]);
            if u16_at(0) != SIGNATURE {
                return Err(bad(format!("bad vector signature 0x{:04x}", u16_at(0))));
            }
            let header_len = rest[3] as usize * 4;
            let total = u32_at(4) as usize * 4;
            let count = u32_at(8) as usize;
            let dtype = rest[12];
            let flags = u16_at(14);
            if dtype != DTYPE_F64 {
                return Err(bad(format!("unsupported data type 0x{:02x}", dtype)));
            }
            let kind = ColumnKind::from_flag(flags).ok_or_else(|| bad(format!("bad vector flags 0x{:04x}", flags)))?;
            if header_len < HEADER_LEN || total < HEADER_LEN {
                return Err(bad(format!(
                    "bad vector sizes: header {} bytes, vector {} bytes",
                    header_len, total
                )));
            }
            if total > rest.len() || header_len + count * 8 > total {
                return Err(bad(format!("vector of {} bytes exceeds buffer", total)));
            }
            let values = rest[header_len..header_len + count * 8]
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect();
            columns.push(VectorColumn {
                kind,
                address: flags & ADDRESS_MASK,
                values,
            });
            rest = &rest[total..];
        }
        Ok(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let mut data = VectorData::new();
        data.append(&[0.0, 1.0, 2.0], PARAMETER_ADDRESS, ColumnKind::Parameter).unwrap();
        let bytes = data.as_bytes();
        assert_eq!(bytes.len(), 24 + 24);
        assert_eq!(&bytes[0..2], &[0xfe, 0xca]);
        assert_eq!(bytes[2], 0);
        assert_eq!(bytes[3], 6);
        assert_eq!(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 12);
        assert_eq!(u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]), 3);
        assert_eq!(bytes[12], DTYPE_F64);
        assert_eq!(u16::from_le_bytes([bytes[14], bytes[15]]), 0x10ff);
        assert_eq!(&bytes[24..32], &0f64.to_le_bytes());
        assert_eq!(&bytes[32..40], &1f64.to_le_bytes());
    }

    #[test]
    fn columns_decode_in_order() {
        let mut data = VectorData::new();
        data.append(&[0.0, 1.0], PARAMETER_ADDRESS, ColumnKind::Parameter).unwrap();
        data.append(&[10.0, 11.0], 3, ColumnKind::Position).unwrap();
        data.append(&[0.5, 0.5], 3, ColumnKind::Slope).unwrap();
        assert_eq!(data.columns(), 3);

        let columns = VectorData::parse(data.as_bytes()).unwrap();
        assert_eq!(columns.len(), 3);
        assert_eq!(columns[1].kind, ColumnKind::Position);
        assert_eq!(columns[1].address, 3);
        assert_eq!(columns[1].values, vec![10.0, 11.0]);
        assert_eq!(columns[2].kind, ColumnKind::Slope);

        let block = data.to_block().unwrap();
        assert_eq!(block.item_size(), 2);
        assert_eq!(block.as_bytes(), data.as_bytes());
    }

    fn raw_header(header_words: u8, total_words: u32, count: u32) -> Vec<u8> {
        let mut raw = Vec::with_capacity(HEADER_LEN);
        raw.extend_from_slice(&SIGNATURE.to_le_bytes());
        raw.push(VERSION);
        raw.push(header_words);
        raw.extend_from_slice(&total_words.to_le_bytes());
        raw.extend_from_slice(&count.to_le_bytes());
        raw.extend_from_slice(&[DTYPE_F64, 0]);
        raw.extend_from_slice(&ColumnKind::Parameter.flag().to_le_bytes());
        raw.extend_from_slice(&0f64.to_le_bytes());
        raw
    }

    #[test]
    fn zero_sized_vector_is_rejected() {
        let err = VectorData::parse(&raw_header(0, 0, 0)).unwrap_err();
        assert!(matches!(err, IcepapError::Protocol { .. }), "{err}");
        assert!(VectorData::parse(&raw_header(6, 0, 0)).is_err());
    }

    #[test]
    fn short_header_is_rejected() {
        // A header claiming 8 bytes would read values out of the header itself.
        let mut raw = raw_header(2, 8, 1);
        raw.extend_from_slice(&1f64.to_le_bytes());
        assert!(VectorData::parse(&raw).is_err());

        let mut valid = raw_header(6, 8, 1);
        valid.extend_from_slice(&1f64.to_le_bytes());
        let columns = VectorData::parse(&valid).unwrap();
        assert_eq!(columns[0].values, vec![1.0]);
    }

    #[test]
    fn oversize_and_corrupt_input() {
        let mut data = VectorData::new();
        assert!(data.append(&vec![0.0; MAX_VALUES + 1], 1, ColumnKind::Position).is_err());
        assert!(VectorData::parse(&[0u8; 10]).is_err());
        assert!(VectorData::parse(&[0u8; 24]).is_err());
    }
}
