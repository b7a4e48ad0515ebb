//! Binary snapshot of an index: configuration plus every stored vector.
//!
//! Layout, all little-endian:
//!
//! ```text
//! u32 dimensions | u32 maxElements | u32 M | u32 efConstruction | u32 seed | u32 currentSize
//! currentSize x ( u32 id | dimensions x f32 )
//! ```
//!
//! There is no checksum and no format version. The only integrity signal is
//! that the file length matches what the header declares.

use std::collections::HashSet;

use crate::config::IndexConfig;
use crate::error::SnapshotError;

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 24;

const WORD: usize = 4;

/// ANN parameters carried in the snapshot header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexParams {
    pub dimensions: usize,
    pub max_elements: usize,
    pub m: usize,
    pub ef_construction: usize,
    pub seed: u32,
}

impl IndexParams {
    pub fn from_config(config: &IndexConfig) -> Self {
        Self {
            dimensions: config.dimensions,
            max_elements: config.max_elements,
            m: config.m,
            ef_construction: config.ef_construction,
            seed: config.seed,
        }
    }
}

/// One persisted vector under its dense id.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredVector {
    pub id: u32,
    pub vector: Vec<f32>,
}

/// Decoded snapshot. `current_size` is the length of `vectors`.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub params: IndexParams,
    pub vectors: Vec<StoredVector>,
}

impl Snapshot {
    pub fn current_size(&self) -> usize {
        self.vectors.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        encode(
            &self.params,
            self.vectors.iter().map(|v| (v.id, v.vector.as_slice())),
        )
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        decode(bytes)
    }
}

/// Exact encoded size for `count` vectors of `dimensions` floats.
pub fn encoded_len(dimensions: usize, count: usize) -> Option<usize> {
    let record = dimensions.checked_mul(WORD)?.checked_add(WORD)?;
    record.checked_mul(count)?.checked_add(HEADER_LEN)
}

/// Encodes the header and `records` in iteration order.
pub fn encode<'a, I>(params: &IndexParams, records: I) -> Result<Vec<u8>, SnapshotError>
where
    I: ExactSizeIterator<Item = (u32, &'a [f32])>,
{
    let count = records.len();
    if count > params.max_elements {
        return Err(SnapshotError::Corrupt(format!(
            "{} vectors exceed maxElements {}",
            count, params.max_elements
        )));
    }
    let total = encoded_len(params.dimensions, count).ok_or(SnapshotError::TooLarge {
        field: "currentSize",
        value: count,
    })?;

    let mut writer = Writer::with_capacity(total);
    writer.put_u32(narrow("dimensions", params.dimensions)?)?;
    writer.put_u32(narrow("maxElements", params.max_elements)?)?;
    writer.put_u32(narrow("m", params.m)?)?;
    writer.put_u32(narrow("efConstruction", params.ef_construction)?)?;
    writer.put_u32(params.seed)?;
    writer.put_u32(narrow("currentSize", count)?)?;

    for (id, vector) in records {
        if vector.len() != params.dimensions {
            return Err(SnapshotError::InvalidVector {
                id,
                expected: params.dimensions,
                actual: vector.len(),
            });
        }
        writer.put_u32(id)?;
        for value in vector {
            writer.put_f32(*value)?;
        }
    }

    debug_assert_eq!(writer.buf.len(), total);
    Ok(writer.buf)
}

/// Decodes a snapshot, copying every vector out of `bytes`.
pub fn decode(bytes: &[u8]) -> Result<Snapshot, SnapshotError> {
    if bytes.len() < HEADER_LEN {
        return Err(SnapshotError::Truncated {
            expected: HEADER_LEN,
            actual: bytes.len(),
        });
    }

    let mut reader = Reader::new(bytes);
    let dimensions = reader.u32()? as usize;
    let max_elements = reader.u32()? as usize;
    let m = reader.u32()? as usize;
    let ef_construction = reader.u32()? as usize;
    let seed = reader.u32()?;
    let current_size = reader.u32()? as usize;

    if dimensions == 0 {
        return Err(SnapshotError::Corrupt("header declares zero dimensions".to_string()));
    }
    if current_size > max_elements {
        return Err(SnapshotError::Corrupt(format!(
            "header declares {} vectors but maxElements is {}",
            current_size, max_elements
        )));
    }
    let expected = encoded_len(dimensions, current_size).ok_or_else(|| {
        SnapshotError::Corrupt(format!(
            "header sizes overflow: {} vectors of {} dimensions",
            current_size, dimensions
        ))
    })?;
    if bytes.len() < expected {
        return Err(SnapshotError::Truncated {
            expected,
            actual: bytes.len(),
        });
    }
    if bytes.len() > expected {
        return Err(SnapshotError::Corrupt(format!(
            "{} trailing bytes after the last vector",
            bytes.len() - expected
        )));
    }

    let mut seen = HashSet::with_capacity(current_size);
    let mut vectors = Vec::with_capacity(current_size);
    for _ in 0..current_size {
        let id = reader.u32()?;
        if !seen.insert(id) {
            return Err(SnapshotError::Corrupt(format!("duplicate vector id {}", id)));
        }
        let vector = reader.f32_vec(dimensions)?;
        vectors.push(StoredVector { id, vector });
    }

    Ok(Snapshot {
        params: IndexParams {
            dimensions,
            max_elements,
            m,
            ef_construction,
            seed,
        },
        vectors,
    })
}

fn narrow(field: &'static str, value: usize) -> Result<u32, SnapshotError> {
    u32::try_from(value).map_err(|_| SnapshotError::TooLarge { field, value })
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    fn check_aligned(&self) -> Result<(), SnapshotError> {
        if self.buf.len() % WORD != 0 {
            return Err(SnapshotError::Misaligned(self.buf.len()));
        }
        Ok(())
    }

    fn put_u32(&mut self, value: u32) -> Result<(), SnapshotError> {
        self.check_aligned()?;
        self.buf.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn put_f32(&mut self, value: f32) -> Result<(), SnapshotError> {
        self.check_aligned()?;
        self.buf.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], SnapshotError> {
        if self.offset % WORD != 0 {
            return Err(SnapshotError::Misaligned(self.offset));
        }
        let end = self.offset.checked_add(len).ok_or(SnapshotError::Truncated {
            expected: usize::MAX,
            actual: self.bytes.len(),
        })?;
        let slice = self.bytes.get(self.offset..end).ok_or(SnapshotError::Truncated {
            expected: end,
            actual: self.bytes.len(),
        })?;
        self.offset = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, SnapshotError> {
        let chunk = self.take(WORD)?;
        Ok(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    }

    fn f32_vec(&mut self, dimensions: usize) -> Result<Vec<f32>, SnapshotError> {
        let chunk = self.take(dimensions * WORD)?;
        Ok(chunk
            .chunks_exact(WORD)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}
