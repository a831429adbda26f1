//! Block-structured container writer.
//!
//! Emits the same tagged format the reader consumes: 16-byte big-endian
//! headers followed by payload bytes, with BLOCK_START / BLOCK_END tags
//! bracketing nested blocks. Used to produce synthetic recordings and to
//! round-trip auxiliary blocks.

use byteorder::{BigEndian, WriteBytesExt};
use std::io::Write;

use crate::channels::ChannelInfo;
use crate::compensation::NamedMatrix;
use crate::error::{RawError, Result};
use crate::tags::{dtype, kind, BlockId, SampleEncoding};

pub struct ContainerWriter<W: Write> {
    out: W,
    open_blocks: Vec<i32>,
}

impl<W: Write> ContainerWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            open_blocks: Vec::new(),
        }
    }

    pub fn write_typed(&mut self, tag_kind: i32, tag_type: i32, payload: &[u8]) -> Result<()> {
        self.out.write_i32::<BigEndian>(tag_kind)?;
        self.out.write_i32::<BigEndian>(tag_type)?;
        self.out.write_i32::<BigEndian>(payload.len() as i32)?;
        self.out.write_i32::<BigEndian>(0)?;
        self.out.write_all(payload)?;
        Ok(())
    }

    pub fn start_block(&mut self, block_type: i32) -> Result<()> {
        self.write_typed(kind::BLOCK_START, dtype::INT32, &block_type.to_be_bytes())?;
        self.open_blocks.push(block_type);
        Ok(())
    }

    pub fn end_block(&mut self, block_type: i32) -> Result<()> {
        match self.open_blocks.pop() {
            Some(open) if open == block_type => {
                self.write_typed(kind::BLOCK_END, dtype::INT32, &block_type.to_be_bytes())
            }
            Some(open) => Err(RawError::Structural(format!(
                "closing block {} while block {} is open",
                block_type, open
            ))),
            None => Err(RawError::Structural(format!(
                "closing block {} with no block open",
                block_type
            ))),
        }
    }

    pub fn write_i32(&mut self, tag_kind: i32, value: i32) -> Result<()> {
        self.write_typed(tag_kind, dtype::INT32, &value.to_be_bytes())
    }

    pub fn write_f32(&mut self, tag_kind: i32, value: f32) -> Result<()> {
        self.write_typed(tag_kind, dtype::FLOAT32, &value.to_be_bytes())
    }

    pub fn write_string(&mut self, tag_kind: i32, value: &str) -> Result<()> {
        self.write_typed(tag_kind, dtype::STRING, value.as_bytes())
    }

    pub fn write_id(&mut self, tag_kind: i32, id: &BlockId) -> Result<()> {
        let mut payload = Vec::with_capacity(20);
        payload.extend_from_slice(&id.version.to_be_bytes());
        payload.extend_from_slice(&id.machid[0].to_be_bytes());
        payload.extend_from_slice(&id.machid[1].to_be_bytes());
        payload.extend_from_slice(&id.secs.to_be_bytes());
        payload.extend_from_slice(&id.usecs.to_be_bytes());
        self.write_typed(tag_kind, dtype::ID, &payload)
    }

    pub fn write_ch_info(&mut self, ch: &ChannelInfo) -> Result<()> {
        self.write_typed(kind::CH_INFO, dtype::CH_INFO, &ch.encode())
    }

    /// Name lists are stored as one colon-joined string.
    pub fn write_name_list(&mut self, tag_kind: i32, names: &[String]) -> Result<()> {
        self.write_string(tag_kind, &names.join(":"))
    }

    pub fn write_named_matrix(&mut self, mat: &NamedMatrix) -> Result<()> {
        self.write_i32(kind::NROW, mat.data.nrows() as i32)?;
        self.write_i32(kind::NCOL, mat.data.ncols() as i32)?;
        self.write_name_list(kind::ROW_NAMES, &mat.row_names)?;
        self.write_name_list(kind::COL_NAMES, &mat.col_names)?;
        let mut payload = Vec::with_capacity(mat.data.len() * 4);
        for v in mat.data.iter() {
            payload.extend_from_slice(&v.to_be_bytes());
        }
        self.write_typed(kind::MATRIX_DATA, dtype::FLOAT32, &payload)
    }

    /// Write one sample buffer, `samples` channel-major (`nchan` rows),
    /// stored sample-major on disk.
    pub fn write_data_buffer(
        &mut self,
        encoding: SampleEncoding,
        samples: &ndarray::Array2<f32>,
    ) -> Result<()> {
        let (nchan, nsamp) = samples.dim();
        let mut payload = Vec::with_capacity(nchan * nsamp * encoding.width());
        for s in 0..nsamp {
            for c in 0..nchan {
                let v = samples[[c, s]];
                match encoding {
                    SampleEncoding::Int16 => {
                        payload.extend_from_slice(&(v.round() as i16).to_be_bytes())
                    }
                    SampleEncoding::Int32 => {
                        payload.extend_from_slice(&(v.round() as i32).to_be_bytes())
                    }
                    SampleEncoding::Float32 => payload.extend_from_slice(&v.to_be_bytes()),
                }
            }
        }
        self.write_typed(kind::DATA_BUFFER, encoding.type_code(), &payload)
    }

    /// Skip marker: `count` nominal buffers of implicit zeros.
    pub fn write_skip(&mut self, count: i32) -> Result<()> {
        self.write_i32(kind::DATA_SKIP, count)
    }

    /// Flush and hand back the underlying stream. Open blocks are a
    /// structural error.
    pub fn finish(mut self) -> Result<W> {
        if let Some(open) = self.open_blocks.last() {
            return Err(RawError::Structural(format!(
                "finish with block {} still open",
                open
            )));
        }
        self.out.flush()?;
        Ok(self.out)
    }
}
