//! Vector table - contiguous row storage
//!
//! Rows are addressed by dense `NodeId`s in insertion order. The table is
//! append-only while an index is being assembled and read-only afterwards.

use std::fmt;

use crate::error::{IndexError, IndexResult};

/// Dense row identifier inside one index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    /// Wrap a raw row number
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw row number
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Row number as an index into per-row vectors
    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Contiguous storage of equal-length f32 rows
///
/// Layout: `[r0_d0, r0_d1, ..., r0_dN, r1_d0, ...]`.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorTable {
    dimension: usize,
    data: Vec<f32>,
}

impl VectorTable {
    /// Create an empty table
    pub fn new(dimension: usize) -> IndexResult<Self> {
        Self::with_capacity(dimension, 0)
    }

    /// Create an empty table with room for `rows` vectors
    pub fn with_capacity(dimension: usize, rows: usize) -> IndexResult<Self> {
        if dimension == 0 {
            return Err(IndexError::InvalidDimension { dimension });
        }
        Ok(Self {
            dimension,
            data: Vec::with_capacity(dimension * rows),
        })
    }

    /// Build a table from an iterator of rows
    pub fn from_rows<I, V>(dimension: usize, rows: I) -> IndexResult<Self>
    where
        I: IntoIterator<Item = V>,
        V: AsRef<[f32]>,
    {
        let rows = rows.into_iter();
        let mut table = Self::with_capacity(dimension, rows.size_hint().0)?;
        for row in rows {
            table.push(row.as_ref())?;
        }
        Ok(table)
    }

    /// Rebuild a table from its flat representation
    pub(crate) fn from_flat(dimension: usize, data: Vec<f32>) -> IndexResult<Self> {
        if dimension == 0 {
            return Err(IndexError::InvalidDimension { dimension });
        }
        if data.len() % dimension != 0 {
            return Err(IndexError::Format(format!(
                "flat table of {} floats is not a multiple of dimension {}",
                data.len(),
                dimension
            )));
        }
        Ok(Self { dimension, data })
    }

    /// Append a row, returning its id
    pub fn push(&mut self, row: &[f32]) -> IndexResult<NodeId> {
        if row.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                got: row.len(),
            });
        }
        let next = self.len();
        let raw = u32::try_from(next)
            .map_err(|_| IndexError::InvalidConfig(format!("table is full at {} rows", next)))?;
        self.data.extend_from_slice(row);
        Ok(NodeId::new(raw))
    }

    /// Get a row by id
    #[inline]
    pub fn get(&self, node: NodeId) -> Option<&[f32]> {
        let start = node.as_usize().checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    /// Row dimension
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.data.len() / self.dimension
    }

    /// Whether the table has no rows
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterate rows in id order
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &[f32])> + '_ {
        self.data
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(i, row)| (NodeId::new(i as u32), row))
    }

    pub(crate) fn as_flat(&self) -> &[f32] {
        &self.data
    }
}
