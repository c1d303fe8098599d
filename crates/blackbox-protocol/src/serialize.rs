use thiserror::Error;

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer out of space")]
    OutOfSpace,
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    #[error("packet type {0} is never serialized")]
    NotSerializable(u8),
    #[error("bad protocol magic")]
    BadMagic,
}

/// Cursor over an output buffer. Scalars are written in host byte order; the
/// protocol targets a single homogeneous byte order across peers.
pub struct Writer<'a> {
    buf: &'a mut [u8],
    cursor: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        if self.cursor + bytes.len() > self.buf.len() {
            return Err(CodecError::OutOfSpace);
        }
        self.buf[self.cursor..self.cursor + bytes.len()].copy_from_slice(bytes);
        self.cursor += bytes.len();
        Ok(())
    }

    #[inline]
    pub fn u8(&mut self, v: u8) -> Result<(), CodecError> {
        self.put(&[v])
    }

    #[inline]
    pub fn u16(&mut self, v: u16) -> Result<(), CodecError> {
        self.put(&v.to_ne_bytes())
    }

    #[inline]
    pub fn u32(&mut self, v: u32) -> Result<(), CodecError> {
        self.put(&v.to_ne_bytes())
    }

    #[inline]
    pub fn u64(&mut self, v: u64) -> Result<(), CodecError> {
        self.put(&v.to_ne_bytes())
    }

    #[inline]
    pub fn i32(&mut self, v: i32) -> Result<(), CodecError> {
        self.put(&v.to_ne_bytes())
    }

    #[inline]
    pub fn f64(&mut self, v: f64) -> Result<(), CodecError> {
        self.put(&v.to_ne_bytes())
    }

    #[inline]
    pub fn bytes(&mut self, v: &[u8]) -> Result<(), CodecError> {
        self.put(v)
    }

    /// `[len: u16][bytes]`, rejected when `len >= capacity`.
    pub fn str_prefixed(&mut self, s: &str, capacity: usize) -> Result<(), CodecError> {
        if s.len() >= capacity {
            return Err(CodecError::OutOfSpace);
        }
        self.u16(s.len() as u16)?;
        self.put(s.as_bytes())
    }

    /// Raw bytes with no length; the frame length delimits them. Rejected
    /// when the text would not fit its receive-side buffer.
    pub fn str_remaining(&mut self, s: &str, capacity: usize) -> Result<(), CodecError> {
        if s.len() >= capacity {
            return Err(CodecError::OutOfSpace);
        }
        self.put(s.as_bytes())
    }
}

/// Cursor over an input buffer; the mirror of [`Writer`].
pub struct Reader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.cursor + n > self.buf.len() {
            return Err(CodecError::OutOfSpace);
        }
        let out = &self.buf[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(out)
    }

    #[inline]
    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    #[inline]
    pub fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_ne_bytes(self.take(2)?.try_into().unwrap()))
    }

    #[inline]
    pub fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_ne_bytes(self.take(4)?.try_into().unwrap()))
    }

    #[inline]
    pub fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_ne_bytes(self.take(8)?.try_into().unwrap()))
    }

    #[inline]
    pub fn i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_ne_bytes(self.take(4)?.try_into().unwrap()))
    }

    #[inline]
    pub fn f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_ne_bytes(self.take(8)?.try_into().unwrap()))
    }

    #[inline]
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        self.take(n)
    }

    pub fn str_prefixed(&mut self, capacity: usize) -> Result<String, CodecError> {
        let len = self.u16()? as usize;
        if len >= capacity {
            return Err(CodecError::OutOfSpace);
        }
        Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
    }

    /// Consumes the rest of the buffer as text; the decoder supplies the
    /// implicit nul by bounding the text one byte short of its capacity.
    pub fn str_remaining(&mut self, capacity: usize) -> Result<String, CodecError> {
        let len = self.remaining();
        if len >= capacity {
            return Err(CodecError::OutOfSpace);
        }
        Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
    }

    pub fn bytes_remaining(&mut self, capacity: usize) -> Result<&'a [u8], CodecError> {
        let len = self.remaining();
        if len > capacity {
            return Err(CodecError::OutOfSpace);
        }
        self.take(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_roundtrip() {
        let mut buf = [0u8; 64];
        let mut w = Writer::new(&mut buf);
        w.u8(7).unwrap();
        w.u16(0x1234).unwrap();
        w.u32(0xdead_beef).unwrap();
        w.u64(u64::MAX - 1).unwrap();
        w.i32(-42).unwrap();
        w.f64(1.5).unwrap();
        let len = w.cursor();

        let mut r = Reader::new(&buf[..len]);
        assert_eq!(r.u8().unwrap(), 7);
        assert_eq!(r.u16().unwrap(), 0x1234);
        assert_eq!(r.u32().unwrap(), 0xdead_beef);
        assert_eq!(r.u64().unwrap(), u64::MAX - 1);
        assert_eq!(r.i32().unwrap(), -42);
        assert_eq!(r.f64().unwrap(), 1.5);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn prefixed_string_respects_capacity() {
        let mut buf = [0u8; 16];
        let mut w = Writer::new(&mut buf);
        assert_eq!(w.str_prefixed("too long for cap", 8), Err(CodecError::OutOfSpace));
        w.str_prefixed("ok", 8).unwrap();
        let len = w.cursor();

        let mut r = Reader::new(&buf[..len]);
        assert_eq!(r.str_prefixed(8).unwrap(), "ok");
    }

    #[test]
    fn remaining_string_consumes_frame() {
        let mut buf = [0u8; 32];
        let mut w = Writer::new(&mut buf);
        w.u32(9).unwrap();
        w.str_remaining("trailing", 16).unwrap();
        let len = w.cursor();

        let mut r = Reader::new(&buf[..len]);
        assert_eq!(r.u32().unwrap(), 9);
        assert_eq!(r.str_remaining(16).unwrap(), "trailing");
    }

    #[test]
    fn truncated_reads_fail() {
        let buf = [1u8, 2];
        let mut r = Reader::new(&buf);
        assert_eq!(r.u32(), Err(CodecError::OutOfSpace));
    }

    #[test]
    fn writer_out_of_space() {
        let mut buf = [0u8; 3];
        let mut w = Writer::new(&mut buf);
        assert_eq!(w.u32(1), Err(CodecError::OutOfSpace));
    }
}
