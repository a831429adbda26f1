//! Per-channel metadata extracted from the measurement-info block.

use std::collections::HashMap;
use std::io::BufRead;

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::{RawError, Result};
use crate::tags::{block, kind, TagStore};
use crate::tree::BlockTree;

/// Channel classification. Stimulus channels bypass filtering; reference
/// channels feed the compensation transform; EOG channels get the
/// secondary filter band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Sensor,
    Reference,
    Stimulus,
    Eog,
    Other,
}

impl ChannelKind {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => ChannelKind::Sensor,
            2 => ChannelKind::Reference,
            3 => ChannelKind::Stimulus,
            4 => ChannelKind::Eog,
            _ => ChannelKind::Other,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            ChannelKind::Sensor => 1,
            ChannelKind::Reference => 2,
            ChannelKind::Stimulus => 3,
            ChannelKind::Eog => 4,
            ChannelKind::Other => 0,
        }
    }
}

/// One channel record. `scan_no` is 1-based and used to detect duplicate
/// or missing records in the info block.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub name: String,
    pub cal: f32,
    pub range: f32,
    pub kind: ChannelKind,
    pub scan_no: i32,
}

impl ChannelInfo {
    pub const PAYLOAD_LEN: usize = 32;

    /// Combined scaling from stored values to physical units.
    pub fn calibration(&self) -> f32 {
        self.cal * self.range
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < Self::PAYLOAD_LEN {
            return Err(RawError::Structural(format!(
                "channel record of {} bytes, expected {}",
                payload.len(),
                Self::PAYLOAD_LEN
            )));
        }
        let mut cursor = &payload[..16];
        let scan_no = cursor.read_i32::<BigEndian>()?;
        let kind_code = cursor.read_i32::<BigEndian>()?;
        let range = cursor.read_f32::<BigEndian>()?;
        let cal = cursor.read_f32::<BigEndian>()?;
        let name = String::from_utf8_lossy(&payload[16..32])
            .trim_end_matches([' ', '\0'])
            .to_string();
        Ok(Self {
            name,
            cal,
            range,
            kind: ChannelKind::from_code(kind_code),
            scan_no,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::PAYLOAD_LEN);
        out.extend_from_slice(&self.scan_no.to_be_bytes());
        out.extend_from_slice(&self.kind.code().to_be_bytes());
        out.extend_from_slice(&self.range.to_be_bytes());
        out.extend_from_slice(&self.cal.to_be_bytes());
        let mut name = [b' '; 16];
        let bytes = self.name.as_bytes();
        let n = bytes.len().min(16);
        name[..n].copy_from_slice(&bytes[..n]);
        out.extend_from_slice(&name);
        out
    }
}

/// All channels of a recording, with a name lookup map built once at open
/// time and a bad-channel mask.
pub struct ChannelCatalog {
    channels: Vec<ChannelInfo>,
    index: HashMap<String, usize>,
    bad: Vec<bool>,
}

impl ChannelCatalog {
    pub fn from_tree<R: std::io::Read + std::io::Seek>(
        store: &mut TagStore<R>,
        tree: &BlockTree,
    ) -> Result<Self> {
        let info_nodes = tree.find_by_type(tree.root(), block::MEAS_INFO);
        let info = *info_nodes
            .first()
            .ok_or_else(|| RawError::MissingData("measurement info block".into()))?;

        let nchan = tree
            .find_tag(store, info, kind::NCHAN)?
            .ok_or_else(|| RawError::MissingData("channel count tag".into()))?
            .as_i32()? as usize;

        let mut channels = Vec::with_capacity(nchan);
        for rec in tree.node(info).entries.iter() {
            if rec.kind == kind::CH_INFO {
                let tag = store.read_at(rec.pos)?;
                channels.push(ChannelInfo::parse(&tag.data)?);
            }
        }
        if channels.len() != nchan {
            return Err(RawError::Structural(format!(
                "info block declares {} channels but carries {} records",
                nchan,
                channels.len()
            )));
        }

        // Scan numbers are 1-based and must cover 1..=nchan exactly once.
        let mut seen = vec![false; nchan];
        for ch in &channels {
            let idx = ch.scan_no - 1;
            if idx < 0 || idx as usize >= nchan || seen[idx as usize] {
                log::error!("bad scan number {} for channel {:?}", ch.scan_no, ch.name);
                return Err(RawError::Structural(format!(
                    "duplicate or out-of-range scan number {}",
                    ch.scan_no
                )));
            }
            seen[idx as usize] = true;
        }

        let index = channels
            .iter()
            .enumerate()
            .map(|(i, ch)| (ch.name.to_lowercase(), i))
            .collect();
        let bad = vec![false; nchan];

        let mut catalog = Self {
            channels,
            index,
            bad,
        };
        catalog.read_bad_channel_blocks(store, tree)?;
        Ok(catalog)
    }

    fn read_bad_channel_blocks<R: std::io::Read + std::io::Seek>(
        &mut self,
        store: &mut TagStore<R>,
        tree: &BlockTree,
    ) -> Result<()> {
        for node in tree.find_by_type(tree.root(), block::BAD_CHANNELS) {
            for rec in tree.node(node).entries.iter() {
                if rec.kind == kind::BAD_CH_NAME {
                    let name = store.read_at(rec.pos)?.as_string()?;
                    self.mark_bad(&name);
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channels(&self) -> &[ChannelInfo] {
        &self.channels
    }

    pub fn channel(&self, idx: usize) -> &ChannelInfo {
        &self.channels[idx]
    }

    /// Case-insensitive name lookup.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(&name.to_lowercase()).copied()
    }

    pub fn is_bad(&self, idx: usize) -> bool {
        self.bad[idx]
    }

    pub fn has_reference_channels(&self) -> bool {
        self.channels
            .iter()
            .any(|ch| ch.kind == ChannelKind::Reference)
    }

    fn mark_bad(&mut self, name: &str) {
        match self.position(name) {
            Some(idx) => self.bad[idx] = true,
            None => log::warn!("bad-channel entry {:?} matches no channel", name),
        }
    }

    /// Load a newline-delimited bad-channel list. Blank lines and lines
    /// starting with `#` are ignored; names match case-insensitively.
    pub fn load_bad_channels<B: BufRead>(&mut self, reader: B) -> Result<usize> {
        let mut marked = 0;
        for line in reader.lines() {
            let line = line?;
            let name = line.trim();
            if name.is_empty() || name.starts_with('#') {
                continue;
            }
            if let Some(idx) = self.position(name) {
                if !self.bad[idx] {
                    self.bad[idx] = true;
                    marked += 1;
                }
            } else {
                log::warn!("bad-channel entry {:?} matches no channel", name);
            }
        }
        Ok(marked)
    }
}
