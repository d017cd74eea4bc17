use crate::error::TpmError;

/// Big-endian reader/writer for TPM wire structures.
#[derive(Debug, Default, Clone)]
pub struct TpmBuffer {
    buffer: Vec<u8>,
    position: usize,
}

impl TpmBuffer {
    pub fn new() -> Self {
        TpmBuffer {
            buffer: Vec::new(),
            position: 0,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        TpmBuffer {
            buffer: bytes,
            position: 0,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.buffer.clone()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Number of bytes not yet consumed by a read.
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    /// Write bytes with no length prefix.
    pub fn write_raw(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Write a TPM2B-style buffer with a 16-bit size prefix.
    pub fn write_sized(&mut self, data: &[u8]) -> Result<(), TpmError> {
        let size = u16::try_from(data.len()).map_err(|_| TpmError::BufferOverflow)?;
        self.write_u16(size);
        self.write_raw(data);
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&[u8], TpmError> {
        if self.remaining() < len {
            return Err(TpmError::BufferUnderflow);
        }
        let start = self.position;
        self.position += len;
        Ok(&self.buffer[start..self.position])
    }

    pub fn read_u8(&mut self) -> Result<u8, TpmError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, TpmError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, TpmError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, TpmError> {
        let mut v = [0u8; 8];
        v.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(v))
    }

    pub fn read_i32(&mut self) -> Result<i32, TpmError> {
        Ok(self.read_u32()? as i32)
    }

    /// Read exactly `len` bytes with no length prefix.
    pub fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, TpmError> {
        Ok(self.take(len)?.to_vec())
    }

    /// Read a TPM2B-style buffer with a 16-bit size prefix.
    pub fn read_sized(&mut self) -> Result<Vec<u8>, TpmError> {
        let len = self.read_u16()? as usize;
        self.read_raw(len)
    }

    pub fn reset(&mut self) {
        self.position = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read() {
        let mut buffer = TpmBuffer::new();
        buffer.write_u8(0x12);
        buffer.write_u16(0x3456);
        buffer.write_u32(0x789ABCDE);
        buffer.write_u64(0x0102030405060708);
        buffer.write_i32(-60);
        buffer.write_sized(b"foo").unwrap();
        assert_eq!(&buffer.to_bytes()[15..19], &[0xff, 0xff, 0xff, 0xc4]);

        buffer.reset();

        assert_eq!(buffer.read_u8().unwrap(), 0x12);
        assert_eq!(buffer.read_u16().unwrap(), 0x3456);
        assert_eq!(buffer.read_u32().unwrap(), 0x789ABCDE);
        assert_eq!(buffer.read_u64().unwrap(), 0x0102030405060708);
        assert_eq!(buffer.read_i32().unwrap(), -60);
        assert_eq!(buffer.read_sized().unwrap(), b"foo");
        assert_eq!(buffer.remaining(), 0);
    }

    #[test]
    fn test_buffer_underflow() {
        let mut buffer = TpmBuffer::new();
        assert!(matches!(buffer.read_u8(), Err(TpmError::BufferUnderflow)));

        let mut buffer = TpmBuffer::from_bytes(vec![0x00, 0x05, 0x01]);
        assert!(matches!(buffer.read_sized(), Err(TpmError::BufferUnderflow)));
    }

    #[test]
    fn test_sized_overflow() {
        let mut buffer = TpmBuffer::new();
        let data = vec![0u8; 0x10000];
        assert!(matches!(buffer.write_sized(&data), Err(TpmError::BufferOverflow)));
    }
}
