//! Sized byte-stream abstractions over files and buffers, with typed
//! integer and fixed-width hash I/O.
//!
//! `SectionReader` gives a bounded `Read` window into a shared pack file
//! without moving the file cursor, so concurrent readers never race on
//! seeks. `PayloadReader` optionally layers zlib decompression on top.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::fs::FileExt;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::ZlibDecoder;

use crate::error::{Result, StoreError};
use crate::object::{ObjectHash, ObjectInfo, HASH_SIZE, INFO_SIZE};

/// A bounded reader over `(file, offset, len)` backed by positional reads.
pub struct SectionReader<'a> {
    file: &'a File,
    pos: u64,
    remaining: u64,
}

impl<'a> SectionReader<'a> {
    pub fn new(file: &'a File, offset: u64, len: u64) -> Self {
        Self {
            file,
            pos: offset,
            remaining: len,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl Read for SectionReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(self.remaining as usize);
        let n = self.file.read_at(&mut buf[..want], self.pos)?;
        self.pos += n as u64;
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Byte stream over a stored payload, decompressing when the object was
/// admitted to compression at write time.
pub enum PayloadReader<'a> {
    Raw(SectionReader<'a>),
    Compressed {
        decoder: ZlibDecoder<SectionReader<'a>>,
        /// Declared decompressed size, used to pre-size reads
        payload_size: u64,
    },
}

impl PayloadReader<'_> {
    /// Read the whole payload into memory.
    pub fn read_all(mut self) -> Result<Vec<u8>> {
        let cap = match &self {
            PayloadReader::Raw(r) => r.remaining(),
            PayloadReader::Compressed { payload_size, .. } => *payload_size,
        };
        let mut buf = Vec::with_capacity(cap as usize);
        self.read_to_end(&mut buf)?;
        if let PayloadReader::Compressed { payload_size, .. } = &self {
            if buf.len() as u64 != *payload_size {
                return Err(StoreError::CorruptPack(format!(
                    "decompressed payload is {} bytes, header declared {}",
                    buf.len(),
                    payload_size
                )));
            }
        }
        Ok(buf)
    }
}

impl Read for PayloadReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            PayloadReader::Raw(r) => r.read(buf),
            PayloadReader::Compressed { decoder, .. } => decoder.read(buf),
        }
    }
}

/// Typed reads shared by the pack and log loaders.
pub trait StreamReadExt: Read {
    /// Read a little-endian u32, or `None` on clean EOF at this boundary.
    fn read_u32_or_eof(&mut self) -> io::Result<Option<u32>> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < 4 {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated u32",
                ));
            }
            filled += n;
        }
        Ok(Some(u32::from_le_bytes(buf)))
    }

    fn read_u32_le(&mut self) -> io::Result<u32> {
        self.read_u32::<LittleEndian>()
    }

    fn read_hash(&mut self) -> io::Result<ObjectHash> {
        let mut buf = [0u8; HASH_SIZE];
        self.read_exact(&mut buf)?;
        Ok(ObjectHash(buf))
    }

    fn read_info(&mut self) -> Result<ObjectInfo> {
        let mut buf = [0u8; INFO_SIZE];
        self.read_exact(&mut buf)?;
        ObjectInfo::from_bytes(&buf)
    }
}

impl<R: Read + ?Sized> StreamReadExt for R {}

/// Typed writes shared by the pack and log writers.
pub trait StreamWriteExt: Write {
    fn write_u32_le(&mut self, v: u32) -> io::Result<()> {
        self.write_u32::<LittleEndian>(v)
    }

    fn write_hash(&mut self, hash: &ObjectHash) -> io::Result<()> {
        self.write_all(hash.as_bytes())
    }

    fn write_info(&mut self, info: &ObjectInfo) -> io::Result<()> {
        self.write_all(&info.to_bytes())
    }
}

impl<W: Write + ?Sized> StreamWriteExt for W {}
