//! XDR file streams for size-prefixed binary frames.
//!
//! Implements the record-mark wire format used by bucket files and
//! checkpoint streams: each frame is a 4-byte big-endian size header with
//! bit 31 (the "continuation bit") set, followed by the canonical XDR
//! payload (RFC 1832 / RFC 4506 record marking standard).
//!
//! The output stream can feed every emitted byte (header included) into
//! a caller-supplied streaming hash, which is how bucket content hashes
//! are computed without a second pass over the file.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use sha2::{Digest, Sha256};
use stellar_xdr::curr::{Limits, ReadXdr, WriteXdr};

/// An output stream that writes XDR values with record-mark framing.
///
/// Durability is caller-selected: with `fsync_on_close` set, [`close`]
/// flushes and fsyncs the file before returning.
///
/// [`close`]: XdrOutputFileStream::close
pub struct XdrOutputFileStream {
    writer: BufWriter<File>,
    fsync_on_close: bool,
}

impl XdrOutputFileStream {
    /// Open an output stream, creating or truncating the file at `path`.
    pub fn open(path: &Path, fsync_on_close: bool) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            fsync_on_close,
        })
    }

    /// Serialize a value and write it as a size-prefixed frame.
    ///
    /// The exact emitted bytes (header and payload) are fed into `hasher`
    /// and counted into `bytes_put` when supplied.
    ///
    /// # Panics
    ///
    /// Panics if the serialized payload is >= 2 GiB; the record-mark
    /// header cannot represent larger frames.
    pub fn write_one<T: WriteXdr>(
        &mut self,
        value: &T,
        hasher: Option<&mut Sha256>,
        bytes_put: Option<&mut u64>,
    ) -> io::Result<()> {
        let payload = value
            .to_xdr(Limits::none())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let sz = payload.len() as u32;
        assert!(
            sz < 0x8000_0000,
            "XDR payload size {} exceeds maximum (0x80000000)",
            sz
        );

        // 4-byte size header with continuation bit (bit 31) set
        let header: [u8; 4] = [
            ((sz >> 24) & 0xFF) as u8 | 0x80,
            ((sz >> 16) & 0xFF) as u8,
            ((sz >> 8) & 0xFF) as u8,
            (sz & 0xFF) as u8,
        ];

        self.writer.write_all(&header)?;
        self.writer.write_all(&payload)?;

        if let Some(hasher) = hasher {
            hasher.update(header);
            hasher.update(&payload);
        }
        if let Some(bytes_put) = bytes_put {
            *bytes_put += 4 + payload.len() as u64;
        }

        Ok(())
    }

    /// Flush and close the stream, fsyncing if the stream was opened with
    /// `fsync_on_close`.
    pub fn close(mut self) -> io::Result<()> {
        self.writer.flush()?;
        if self.fsync_on_close {
            self.writer.get_ref().sync_all()?;
        }
        Ok(())
    }
}

/// An input stream that reads size-prefixed XDR frames from a file.
///
/// Supports seeking to a byte offset previously recorded via [`pos`],
/// which is how bucket indexes address individual records.
///
/// [`pos`]: XdrInputFileStream::pos
pub struct XdrInputFileStream {
    reader: BufReader<File>,
    pos: u64,
}

impl XdrInputFileStream {
    /// Open an input stream over the file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            pos: 0,
        })
    }

    /// Current byte offset: the position of the next frame header.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Seek to an absolute byte offset (must be a frame boundary).
    pub fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.reader.seek(SeekFrom::Start(offset))?;
        self.pos = offset;
        Ok(())
    }

    /// Read one XDR value from the stream.
    ///
    /// Returns `Ok(None)` only at a clean end of stream (zero bytes
    /// remaining). A frame truncated mid-header or mid-payload is an
    /// error.
    pub fn read_one<T: ReadXdr>(&mut self) -> io::Result<Option<T>> {
        let mut header = [0u8; 4];
        let mut filled = 0;
        while filled < header.len() {
            match self.reader.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "truncated record header",
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        // Strip the continuation bit from the high byte.
        let sz = (((header[0] & 0x7F) as u32) << 24)
            | ((header[1] as u32) << 16)
            | ((header[2] as u32) << 8)
            | (header[3] as u32);

        let mut payload = vec![0u8; sz as usize];
        self.reader.read_exact(&mut payload)?;
        self.pos += 4 + sz as u64;

        let value = T::from_xdr(&payload, Limits::none())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        Ok(Some(value))
    }
}
