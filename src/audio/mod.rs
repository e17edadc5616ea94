pub mod capture;
pub mod playback;

/// Reassemble little-endian PCM16 bytes into samples. A trailing odd
/// byte is discarded.
pub fn pcm16_from_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm16_decoding_is_little_endian() {
        let bytes = [0x01, 0x00, 0xff, 0x7f, 0x00, 0x80];
        assert_eq!(pcm16_from_bytes(&bytes), vec![1, i16::MAX, i16::MIN]);
    }

    #[test]
    fn trailing_odd_byte_is_discarded() {
        assert_eq!(pcm16_from_bytes(&[0x01, 0x00, 0x42]), vec![1]);
    }
}
