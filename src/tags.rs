//! Tagged-record layer of the container format.
//!
//! A recording is a flat sequence of records, each a 16-byte big-endian
//! header `{kind, type, size, next}` followed by `size` payload bytes.
//! [`TagStore`] scans the sequence once into a directory of [`TagRecord`]s
//! and afterwards serves positioned reads; nothing else in the crate
//! touches the byte stream directly.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Read, Seek, SeekFrom};

use crate::error::{RawError, Result};

/// Well-known tag kinds.
pub mod kind {
    pub const FILE_ID: i32 = 100;
    pub const BLOCK_ID: i32 = 103;
    pub const BLOCK_START: i32 = 104;
    pub const BLOCK_END: i32 = 105;
    pub const NOP: i32 = 108;
    pub const PARENT_FILE_ID: i32 = 109;
    pub const PARENT_BLOCK_ID: i32 = 110;

    pub const NCHAN: i32 = 200;
    pub const SAMPLE_RATE: i32 = 201;
    pub const CH_INFO: i32 = 203;
    pub const FIRST_SAMPLE: i32 = 208;
    pub const DATA_BUFFER: i32 = 300;
    pub const DATA_SKIP: i32 = 301;

    pub const NROW: i32 = 3500;
    pub const NCOL: i32 = 3501;
    pub const ROW_NAMES: i32 = 3502;
    pub const COL_NAMES: i32 = 3503;
    pub const MATRIX_DATA: i32 = 3504;
    pub const COMP_GRADE: i32 = 3505;
    pub const PROJ_ITEM_ACTIVE: i32 = 3506;
    pub const PROJ_ITEM_VECTORS: i32 = 3507;
    pub const PROJ_ITEM_NAME: i32 = 3508;
    pub const BAD_CH_NAME: i32 = 3509;
}

/// Block types carried in the payload of BLOCK_START / BLOCK_END tags.
pub mod block {
    pub const ROOT: i32 = 0;
    pub const MEAS: i32 = 100;
    pub const MEAS_INFO: i32 = 101;
    pub const RAW_DATA: i32 = 102;
    pub const PROJECTION: i32 = 313;
    pub const PROJ_ITEM: i32 = 314;
    pub const COMPENSATION: i32 = 315;
    pub const COMP_DATA: i32 = 316;
    pub const BAD_CHANNELS: i32 = 359;
}

/// Payload type codes.
pub mod dtype {
    pub const INT16: i32 = 2;
    pub const INT32: i32 = 3;
    pub const FLOAT32: i32 = 4;
    pub const STRING: i32 = 10;
    pub const ID: i32 = 31;
    pub const CH_INFO: i32 = 30;
}

/// Numeric encoding of a sample buffer. Anything else in a data buffer is
/// rejected with [`RawError::Unsupported`] rather than skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    Int16,
    Int32,
    Float32,
}

impl SampleEncoding {
    pub fn from_type(t: i32) -> Result<Self> {
        match t {
            dtype::INT16 => Ok(SampleEncoding::Int16),
            dtype::INT32 => Ok(SampleEncoding::Int32),
            dtype::FLOAT32 => Ok(SampleEncoding::Float32),
            other => Err(RawError::Unsupported(format!(
                "sample buffer payload type {}",
                other
            ))),
        }
    }

    /// Per-sample width in bytes.
    pub fn width(self) -> usize {
        match self {
            SampleEncoding::Int16 => 2,
            SampleEncoding::Int32 => 4,
            SampleEncoding::Float32 => 4,
        }
    }

    pub fn type_code(self) -> i32 {
        match self {
            SampleEncoding::Int16 => dtype::INT16,
            SampleEncoding::Int32 => dtype::INT32,
            SampleEncoding::Float32 => dtype::FLOAT32,
        }
    }
}

/// Identity payload: version, machine id (two words), wall-clock stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockId {
    pub version: i32,
    pub machid: [i32; 2],
    pub secs: i32,
    pub usecs: i32,
}

/// Directory entry: a tag header plus the absolute file position of that
/// header. The payload is not held here; it is fetched on demand through
/// [`TagStore::read_at`].
#[derive(Debug, Clone, Copy)]
pub struct TagRecord {
    pub kind: i32,
    pub dtype: i32,
    pub size: i32,
    /// Absolute offset of the 16-byte header.
    pub pos: u64,
    pub next: i32,
}

/// A fully read tag: header plus payload bytes.
#[derive(Debug, Clone)]
pub struct Tag {
    pub kind: i32,
    pub dtype: i32,
    pub next: i32,
    pub data: Vec<u8>,
}

impl Tag {
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn as_i32(&self) -> Result<i32> {
        if self.data.len() < 4 {
            return Err(RawError::Structural(format!(
                "tag kind {} too short for an i32 payload",
                self.kind
            )));
        }
        Ok((&self.data[..4]).read_i32::<BigEndian>()?)
    }

    pub fn as_f32(&self) -> Result<f32> {
        if self.data.len() < 4 {
            return Err(RawError::Structural(format!(
                "tag kind {} too short for an f32 payload",
                self.kind
            )));
        }
        Ok((&self.data[..4]).read_f32::<BigEndian>()?)
    }

    pub fn as_f32_vec(&self) -> Result<Vec<f32>> {
        let mut cursor = &self.data[..];
        let mut out = Vec::with_capacity(self.data.len() / 4);
        while cursor.len() >= 4 {
            out.push(cursor.read_f32::<BigEndian>()?);
        }
        Ok(out)
    }

    pub fn as_string(&self) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.data).trim_end().to_string())
    }

    pub fn as_id(&self) -> Result<BlockId> {
        if self.data.len() < 20 {
            return Err(RawError::Structural(format!(
                "tag kind {} too short for an identity payload",
                self.kind
            )));
        }
        let mut cursor = &self.data[..];
        Ok(BlockId {
            version: cursor.read_i32::<BigEndian>()?,
            machid: [
                cursor.read_i32::<BigEndian>()?,
                cursor.read_i32::<BigEndian>()?,
            ],
            secs: cursor.read_i32::<BigEndian>()?,
            usecs: cursor.read_i32::<BigEndian>()?,
        })
    }

    /// Decode a sample buffer into raw (uncalibrated) values, sample-major
    /// on disk, returned channel-major as `nchan` rows.
    pub fn as_samples(&self, nchan: usize) -> Result<ndarray::Array2<f32>> {
        let enc = SampleEncoding::from_type(self.dtype)?;
        let width = enc.width();
        if nchan == 0 || self.data.len() % (nchan * width) != 0 {
            return Err(RawError::Structural(format!(
                "data buffer of {} bytes does not divide into {} channels of width {}",
                self.data.len(),
                nchan,
                width
            )));
        }
        let nsamp = self.data.len() / (nchan * width);
        let mut out = ndarray::Array2::<f32>::zeros((nchan, nsamp));
        let mut cursor = &self.data[..];
        for s in 0..nsamp {
            for c in 0..nchan {
                let v = match enc {
                    SampleEncoding::Int16 => f32::from(cursor.read_i16::<BigEndian>()?),
                    SampleEncoding::Int32 => cursor.read_i32::<BigEndian>()? as f32,
                    SampleEncoding::Float32 => cursor.read_f32::<BigEndian>()?,
                };
                out[[c, s]] = v;
            }
        }
        Ok(out)
    }
}

/// Sequential store of tagged records with positioned random access.
///
/// The directory is scanned once at open time without touching payloads
/// (except to skip over them); a truncated trailing record ends the scan
/// with a warning instead of failing, so partially written recordings
/// still open.
pub struct TagStore<R> {
    reader: R,
    directory: Vec<TagRecord>,
}

impl<R: Read + Seek> TagStore<R> {
    pub fn open(mut reader: R) -> Result<Self> {
        let mut directory = Vec::new();
        let mut pos = reader.seek(SeekFrom::Start(0))?;
        loop {
            let kind = match reader.read_i32::<BigEndian>() {
                Ok(v) => v,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            let (dtype, size, next) = match Self::read_header_rest(&mut reader) {
                Ok(v) => v,
                Err(_) => {
                    log::warn!("truncated tag header at offset {}, stopping scan", pos);
                    break;
                }
            };
            if size < 0 {
                return Err(RawError::Structural(format!(
                    "negative payload size {} at offset {}",
                    size, pos
                )));
            }
            directory.push(TagRecord {
                kind,
                dtype,
                size,
                pos,
                next,
            });
            if next < 0 {
                break;
            }
            pos = if next > 0 {
                reader.seek(SeekFrom::Start(next as u64))?
            } else {
                reader.seek(SeekFrom::Current(i64::from(size)))?
            };
        }
        log::debug!("scanned {} tag records", directory.len());
        Ok(Self { reader, directory })
    }

    pub fn directory(&self) -> &[TagRecord] {
        &self.directory
    }

    /// Positioned read of one tag, header and payload.
    pub fn read_at(&mut self, pos: u64) -> Result<Tag> {
        self.reader.seek(SeekFrom::Start(pos))?;
        let kind = self.reader.read_i32::<BigEndian>()?;
        let (dtype, size, next) = Self::read_header_rest(&mut self.reader)?;
        if size < 0 {
            return Err(RawError::Structural(format!(
                "negative payload size {} at offset {}",
                size, pos
            )));
        }
        let mut data = vec![0u8; size as usize];
        self.reader.read_exact(&mut data)?;
        Ok(Tag {
            kind,
            dtype,
            next,
            data,
        })
    }

    fn read_header_rest(reader: &mut R) -> std::io::Result<(i32, i32, i32)> {
        let dtype = reader.read_i32::<BigEndian>()?;
        let size = reader.read_i32::<BigEndian>()?;
        let next = reader.read_i32::<BigEndian>()?;
        Ok((dtype, size, next))
    }
}
