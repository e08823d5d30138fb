// SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Read, Write};

/// Common function for reading a structure from a reader.
pub trait FromReader<R: Read>: Sized {
    type Error;

    fn from_reader(reader: R) -> Result<Self, Self::Error>;
}

/// Common function for writing a structure to a writer.
pub trait ToWriter<W: Write>: Sized {
    type Error;

    fn to_writer(&self, writer: W) -> Result<(), Self::Error>;
}

/// A writer wrapper that counts the number of bytes written.
pub struct CountingWriter<W> {
    inner: W,
    offset: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, offset: 0 }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn finish(self) -> (W, u64) {
        (self.inner, self.offset)
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.offset += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_bytes() {
        let mut writer = CountingWriter::new(Vec::new());
        writer.write_all(b"abc").unwrap();
        assert_eq!(writer.offset(), 3);
        writer.write_all(&[0xff; 5000]).unwrap();

        let (data, n) = writer.finish();
        assert_eq!(n, 5003);
        assert_eq!(&data[..3], b"abc");
        assert!(data[3..].iter().all(|b| *b == 0xff));
    }

    #[test]
    fn short_writer() {
        let mut buf = [0u8; 4];
        let mut writer = CountingWriter::new(&mut buf[..]);

        assert!(writer.write_all(&[0xaa; 8]).is_err());
        assert_eq!(writer.offset(), 4);
        assert_eq!(buf, [0xaa; 4]);
    }
}
