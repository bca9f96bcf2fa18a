//! Length prefix of dynamically-sized exchanges.
//!
//! Every sending stream of a dynamic exchange starts with the grand total of
//! the message as 8 big-endian bytes, followed by its own share of the data.

use bincode::config::{BigEndian, Configuration, Fixint};

use crate::{Error, Result};

/// Bytes taken by the length prefix on the wire.
pub const SIZE_PREFIX_LEN: usize = 8;

const PREFIX_CONFIG: Configuration<BigEndian, Fixint> = bincode::config::standard()
    .with_big_endian()
    .with_fixed_int_encoding();

/// Encodes the total message size carried in front of a dynamic exchange.
pub fn encode_size(total: u64) -> Result<[u8; SIZE_PREFIX_LEN]> {
    let mut prefix = [0u8; SIZE_PREFIX_LEN];
    let written = bincode::encode_into_slice(total, &mut prefix, PREFIX_CONFIG)
        .map_err(|e| Error::Codec(e.to_string()))?;
    debug_assert_eq!(written, SIZE_PREFIX_LEN);
    Ok(prefix)
}

/// Decodes a length prefix read from the wire.
pub fn decode_size(prefix: &[u8; SIZE_PREFIX_LEN]) -> Result<u64> {
    let (total, _) = bincode::decode_from_slice::<u64, _>(prefix, PREFIX_CONFIG)
        .map_err(|e| Error::Codec(e.to_string()))?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_big_endian() {
        let prefix = encode_size(0x0102_0304_0506_0708).unwrap();
        assert_eq!(prefix, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(encode_size(0).unwrap(), [0; 8]);
        assert_eq!(encode_size(8192).unwrap(), [0, 0, 0, 0, 0, 0, 0x20, 0]);
    }

    #[test]
    fn decodes_what_the_reference_writes() {
        assert_eq!(decode_size(&[0, 0, 0, 0, 0, 0x10, 0, 1]).unwrap(), 0x10_0001);
        assert_eq!(decode_size(&[0xff; 8]).unwrap(), u64::MAX);
    }
}
