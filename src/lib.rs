//! Streaming access to tagged binary neurophysiology recordings.
//!
//! A recording is a flat run of self-describing tagged records that
//! bracket nested blocks. This crate scans the run once into a directory,
//! rebuilds the block hierarchy, indexes the sample buffers of the
//! raw-data block and then serves random sample-range reads with
//! calibration, interference compensation, subspace projection and
//! frequency-domain filtering applied on the fly. Decoded data is cached
//! in fixed memory pools, so arbitrarily long recordings stream in
//! constant space.
//!
//! # Example
//!
//! ```no_run
//! use neuroraw::{RawReader, ReaderOptions};
//! use std::fs::File;
//!
//! # fn main() -> neuroraw::Result<()> {
//! let file = File::open("recording.dat")?;
//! let mut reader = RawReader::open(file, ReaderOptions::default())?;
//! let segment = reader.pick(None, reader.first_sample(), 1000)?;
//! println!("{} channels, {} samples", segment.nrows(), segment.ncols());
//! # Ok(())
//! # }
//! ```

pub mod buffers;
pub mod channels;
pub mod compensation;
pub mod error;
pub mod filter;
pub mod projection;
pub mod raw;
pub mod tags;
pub mod tree;
pub mod writer;

pub use buffers::{BufferDescriptor, BufferIndex, BufferKind, RingBufferPool};
pub use channels::{ChannelCatalog, ChannelInfo, ChannelKind};
pub use compensation::{CompensationOperator, CompensationSet, NamedMatrix, SparseSelector};
pub use error::{RawError, Result};
pub use filter::{FilterBand, FilterDefinition, FilterResponseEngine};
pub use projection::{ProjectionItem, ProjectionOperator};
pub use raw::{ChannelSelection, RawReader, ReaderOptions};
pub use tags::{BlockId, SampleEncoding, Tag, TagRecord, TagStore};
pub use tree::{BlockNode, BlockTree};
pub use writer::ContainerWriter;
