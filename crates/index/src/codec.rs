//! Index serialization
//!
//! ## Format (version 0x01)
//!
//! ```text
//! [Magic: "LHNS"]
//! [Version: u8]
//! [Metric: u8]
//! [Dimension: u32 LE]
//! [M: u32 LE] [ef_construction: u32 LE] [ef_search: u32 LE] [Seed: u64 LE]
//! [Node Count: u32 LE]
//! [Vectors: count * dimension f32 LE, in NodeId order]
//! [Has Entry: u8] [Entry: u32 LE if has entry]
//! [Max Level: u32 LE]
//! For each node (in NodeId order):
//!   [Layer Count: u32 LE]
//!   For each layer:
//!     [Neighbor Count: u32 LE]
//!     [Neighbors: u32 LE each, ascending]
//! ```
//!
//! Decoding validates the graph before returning an index, so a truncated
//! or tampered buffer surfaces as [`IndexError::Format`].

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::distance::DistanceMetric;
use crate::error::{IndexError, IndexResult};
use crate::hnsw::{HnswConfig, HnswIndex, HnswNode};
use crate::table::{NodeId, VectorTable};

/// Leading bytes of an encoded index
pub const INDEX_MAGIC: [u8; 4] = *b"LHNS";

/// Encoded index format version
pub const INDEX_FORMAT_VERSION: u8 = 0x01;

/// Upper bound on speculative preallocation while decoding
const MAX_PREALLOC: usize = 1 << 20;

fn to_u32(value: usize, what: &str) -> IndexResult<u32> {
    u32::try_from(value).map_err(|_| IndexError::Format(format!("{} {} exceeds u32", what, value)))
}

impl HnswIndex {
    /// Encode the graph and its vectors
    pub fn write_to<W: Write>(&self, writer: &mut W) -> IndexResult<()> {
        writer.write_all(&INDEX_MAGIC)?;
        writer.write_u8(INDEX_FORMAT_VERSION)?;
        writer.write_u8(self.metric.to_byte())?;
        writer.write_u32::<LittleEndian>(to_u32(self.dimension(), "dimension")?)?;
        writer.write_u32::<LittleEndian>(to_u32(self.config.m, "m")?)?;
        writer.write_u32::<LittleEndian>(to_u32(self.config.ef_construction, "ef_construction")?)?;
        writer.write_u32::<LittleEndian>(to_u32(self.config.ef_search, "ef_search")?)?;
        writer.write_u64::<LittleEndian>(self.config.seed)?;

        writer.write_u32::<LittleEndian>(to_u32(self.len(), "node count")?)?;
        for value in self.table.as_flat() {
            writer.write_f32::<LittleEndian>(*value)?;
        }

        match self.entry_point {
            Some(ep) => {
                writer.write_u8(1)?;
                writer.write_u32::<LittleEndian>(ep.as_u32())?;
            }
            None => writer.write_u8(0)?,
        }
        writer.write_u32::<LittleEndian>(to_u32(self.max_level, "max level")?)?;

        for node in &self.nodes {
            writer.write_u32::<LittleEndian>(to_u32(node.neighbors.len(), "layer count")?)?;
            for layer in &node.neighbors {
                writer.write_u32::<LittleEndian>(to_u32(layer.len(), "neighbor count")?)?;
                for id in layer {
                    writer.write_u32::<LittleEndian>(id.as_u32())?;
                }
            }
        }
        Ok(())
    }

    /// Encode into a fresh buffer
    pub fn to_bytes(&self) -> IndexResult<Vec<u8>> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    /// Decode an index written by [`HnswIndex::write_to`]
    pub fn read_from<R: Read>(reader: &mut R) -> IndexResult<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != INDEX_MAGIC {
            return Err(IndexError::Format("bad index magic".into()));
        }
        let version = reader.read_u8()?;
        if version != INDEX_FORMAT_VERSION {
            return Err(IndexError::Format(format!(
                "unsupported index format version {}",
                version
            )));
        }

        let metric = DistanceMetric::from_byte(reader.read_u8()?)?;
        let dimension = reader.read_u32::<LittleEndian>()? as usize;
        let config = HnswConfig {
            m: reader.read_u32::<LittleEndian>()? as usize,
            ef_construction: reader.read_u32::<LittleEndian>()? as usize,
            ef_search: reader.read_u32::<LittleEndian>()? as usize,
            seed: reader.read_u64::<LittleEndian>()?,
        };

        let count = reader.read_u32::<LittleEndian>()? as usize;
        let floats = count
            .checked_mul(dimension)
            .ok_or_else(|| IndexError::Format("vector table size overflows".into()))?;
        let mut flat = Vec::with_capacity(floats.min(MAX_PREALLOC));
        for _ in 0..floats {
            flat.push(reader.read_f32::<LittleEndian>()?);
        }
        let table = VectorTable::from_flat(dimension, flat)?;

        let entry_point = match reader.read_u8()? {
            0 => None,
            1 => Some(NodeId::new(reader.read_u32::<LittleEndian>()?)),
            other => {
                return Err(IndexError::Format(format!("bad entry flag {}", other)));
            }
        };
        let max_level = reader.read_u32::<LittleEndian>()? as usize;

        let mut nodes = Vec::with_capacity(count.min(MAX_PREALLOC));
        for _ in 0..count {
            let layers = reader.read_u32::<LittleEndian>()? as usize;
            if layers > max_level + 1 {
                return Err(IndexError::Format("node level out of range".into()));
            }
            let mut neighbors = Vec::with_capacity(layers);
            for _ in 0..layers {
                let n = reader.read_u32::<LittleEndian>()? as usize;
                let mut layer = Vec::with_capacity(n.min(MAX_PREALLOC));
                for _ in 0..n {
                    layer.push(NodeId::new(reader.read_u32::<LittleEndian>()?));
                }
                neighbors.push(layer);
            }
            nodes.push(HnswNode { neighbors });
        }

        HnswIndex::from_parts(config, metric, table, nodes, entry_point, max_level)
    }

    /// Decode from a byte slice
    pub fn from_bytes(bytes: &[u8]) -> IndexResult<Self> {
        let mut cursor = bytes;
        let index = Self::read_from(&mut cursor)?;
        if !cursor.is_empty() {
            return Err(IndexError::Format(format!(
                "{} trailing bytes after index",
                cursor.len()
            )));
        }
        Ok(index)
    }
}
