use crate::error::MalformedInput;

type ReadResult<T> = std::result::Result<T, MalformedInput>;

/// Big endian cursor over borrowed metadata.
///
/// Every read is checked against the remaining length, nothing is trusted from the input.
#[derive(Clone, Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    pub fn get_length(&self) -> usize {
        self.data.len()
    }

    pub fn get_position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn skip(&mut self, bytes: usize) -> ReadResult<()> {
        self.take(bytes).map(|_| ())
    }

    pub fn read_u8(&mut self) -> ReadResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> ReadResult<u16> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u24(&mut self) -> ReadResult<u32> {
        let buf = self.take(3)?;
        Ok(u32::from_be_bytes([0, buf[0], buf[1], buf[2]]))
    }

    pub fn read_u32(&mut self) -> ReadResult<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> ReadResult<u64> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    /// Read an unsigned big endian integer stored in `bytes` bytes (at most 8).
    pub fn read_uint(&mut self, bytes: usize) -> ReadResult<u64> {
        if bytes > 8 {
            return Err(MalformedInput::Invalid(format!(
                "{} byte integers are not supported",
                bytes
            )));
        }

        Ok(self
            .take(bytes)?
            .iter()
            .fold(0u64, |acc, x| (acc << 8) | *x as u64))
    }

    pub fn read_bytes_u8(&mut self, bytes: usize) -> ReadResult<&'a [u8]> {
        self.take(bytes)
    }

    pub fn read_array<const N: usize>(&mut self) -> ReadResult<[u8; N]> {
        let mut buf = [0; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    /// Everything that has not been read yet.
    pub fn read_remaining(&mut self) -> &'a [u8] {
        let rest = &self.data[self.position..];
        self.position = self.data.len();
        rest
    }

    fn take(&mut self, bytes: usize) -> ReadResult<&'a [u8]> {
        let end = self
            .position
            .checked_add(bytes)
            .filter(|x| *x <= self.data.len())
            .ok_or(MalformedInput::ShortRead {
                offset: self.position,
                needed: bytes,
                available: self.remaining(),
            })?;
        let buf = &self.data[self.position..end];
        self.position = end;
        Ok(buf)
    }
}
