//! Base-128 varints and length-prefixed strings.

use super::decoder::DecodeError;

/// Longest encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Appends `n` as a base-128 varint: 7 data bits per byte, least significant
/// group first, high bit set on every byte but the last.
pub fn append_varint(buf: &mut Vec<u8>, mut n: u64) {
    loop {
        let bits = (n & 0x7F) as u8;
        n >>= 7;
        if n == 0 {
            buf.push(bits);
            return;
        }
        buf.push(bits | 0x80);
    }
}

/// Appends a varint byte length followed by the raw bytes.
pub fn append_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    append_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

pub fn append_string(buf: &mut Vec<u8>, s: &str) {
    append_bytes(buf, s.as_bytes());
}

/// Forward-only cursor over an encoded buffer.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or(DecodeError::UnexpectedEof { offset: self.pos })?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let start = self.pos;
        let mut n = 0u64;

        for i in 0..MAX_VARINT_LEN {
            let byte = self.read_u8()?;
            let bits = u64::from(byte & 0x7F);

            // The tenth byte may only carry the top bit of a u64
            if i == MAX_VARINT_LEN - 1 && bits > 1 {
                return Err(DecodeError::VarintOverflow { offset: start });
            }

            n |= bits << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(n);
            }
        }

        Err(DecodeError::VarintOverflow { offset: start })
    }

    /// Reads a varint and checks it fits a `usize`.
    pub fn read_len(&mut self) -> Result<usize, DecodeError> {
        let offset = self.pos;
        let n = self.read_varint()?;
        usize::try_from(n).map_err(|_| DecodeError::VarintOverflow { offset })
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(DecodeError::UnexpectedEof { offset: self.pos })?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Reads a varint-length-prefixed byte string.
    pub fn read_prefixed(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_len()?;
        self.read_bytes(len)
    }

    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        let offset = self.pos;
        let bytes = self.read_prefixed()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8 { offset })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(n: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        append_varint(&mut buf, n);
        buf
    }

    #[test]
    fn test_known_encodings() {
        assert_eq!(encoded(0), [0x00]);
        assert_eq!(encoded(1), [0x01]);
        assert_eq!(encoded(127), [0x7F]);
        assert_eq!(encoded(128), [0x80, 0x01]);
        assert_eq!(encoded(300), [0xAC, 0x02]);
        assert_eq!(encoded(u64::MAX).len(), MAX_VARINT_LEN);
    }

    #[test]
    fn test_read_back_extremes() {
        for n in [0, 127, 128, 16_383, 16_384, u64::from(u32::MAX), u64::MAX] {
            let buf = encoded(n);
            let mut reader = Reader::new(&buf);
            assert_eq!(reader.read_varint().unwrap(), n);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn test_truncated_varint() {
        let mut reader = Reader::new(&[0x80, 0x80]);
        assert_eq!(
            reader.read_varint().unwrap_err(),
            DecodeError::UnexpectedEof { offset: 2 }
        );
    }

    #[test]
    fn test_overlong_varint() {
        let buf = [0xFF; 11];
        let mut reader = Reader::new(&buf);
        assert_eq!(
            reader.read_varint().unwrap_err(),
            DecodeError::VarintOverflow { offset: 0 }
        );

        // Ten bytes whose last carries more than one bit
        let mut buf = vec![0xFF; 9];
        buf.push(0x02);
        let mut reader = Reader::new(&buf);
        assert!(matches!(
            reader.read_varint(),
            Err(DecodeError::VarintOverflow { .. })
        ));
    }

    #[test]
    fn test_strings() {
        let mut buf = Vec::new();
        append_string(&mut buf, "db.sql");
        append_string(&mut buf, "");
        buf.extend_from_slice(&[0x02, 0xC3, 0x28]);

        let mut reader = Reader::new(&buf);
        assert_eq!(reader.read_string().unwrap(), "db.sql");
        assert_eq!(reader.read_string().unwrap(), "");
        assert_eq!(
            reader.read_string().unwrap_err(),
            DecodeError::InvalidUtf8 { offset: 8 }
        );
    }

    #[test]
    fn test_short_bytes() {
        let mut reader = Reader::new(&[0x05, b'a']);
        assert!(matches!(
            reader.read_prefixed(),
            Err(DecodeError::UnexpectedEof { .. })
        ));
    }
}
