use std::io::{BufRead, ErrorKind, Read};

pub type ReadResult<T> = std::io::Result<T>;

fn truncated(what: &str) -> std::io::Error {
    std::io::Error::new(ErrorKind::UnexpectedEof, format!("Unexpected EoF on {what}"))
}

/// Little-endian scalar reads over any byte source.
pub trait AinRead: Read {
    fn read_u8(&mut self) -> ReadResult<u8> {
        let mut data = [0; 1];
        self.read_exact(&mut data)?;
        Ok(data[0])
    }

    fn read_u16(&mut self) -> ReadResult<u16> {
        let mut data = [0; 2];
        self.read_exact(&mut data)?;
        Ok(u16::from_le_bytes(data))
    }

    fn read_i32(&mut self) -> ReadResult<i32> {
        let mut data = [0; 4];
        self.read_exact(&mut data)?;
        Ok(i32::from_le_bytes(data))
    }

    fn read_u32(&mut self) -> ReadResult<u32> {
        let mut data = [0; 4];
        self.read_exact(&mut data)?;
        Ok(u32::from_le_bytes(data))
    }

    fn read_bytes(&mut self, len: usize) -> ReadResult<Vec<u8>> {
        let mut bytes = vec![0u8; len];
        self.read_exact(&mut bytes)?;
        Ok(bytes)
    }
}

impl<R: Read> AinRead for R {}

/// Reads that need lookahead or a terminator scan.
pub trait AinBufRead: AinRead + BufRead {
    fn read_c_string_raw(&mut self) -> ReadResult<Vec<u8>> {
        let mut buf = vec![];
        self.read_until(b'\x00', &mut buf)?;
        // last byte must be \x00 or we hit EoF mid-string
        if buf.pop() != Some(b'\x00') {
            return Err(truncated("CStr"));
        }
        Ok(buf)
    }

    /// Read the next 4-byte record tag. `None` on a clean end of input;
    /// a partial tag is an error.
    fn read_tag(&mut self) -> ReadResult<Option<[u8; 4]>> {
        if self.fill_buf()?.is_empty() {
            return Ok(None);
        }
        let mut tag = [0u8; 4];
        match self.read_exact(&mut tag) {
            Ok(()) => Ok(Some(tag)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(truncated("tag")),
            Err(e) => Err(e),
        }
    }

    fn peek_u8(&mut self) -> ReadResult<Option<u8>> {
        Ok(self.fill_buf()?.first().copied())
    }
}

impl<R: BufRead> AinBufRead for R {}
