//! Wire format of datasets moved between processes.
//!
//! A block is `header line '\n' | payload`, where the header is a `key=value` line and the
//! payload is the dataset's serde encoding. Image grid geometry only travels in the header.
//! With compression the whole block is framed as `"zlib" | original length u32 LE | zlib`.
//!
//! Blocks are not checksummed. A corrupt compressed block fails to decode or decodes to
//! garbage.
use std::collections::HashMap;
use std::io::{Read, Write};

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use itertools::Itertools;

use crate::{
    comm::{pack_blocks, unpack_blocks},
    constants::{ZLIB_HEADER_LEN, ZLIB_MAGIC},
    error::{Error, Result},
    types::dataset::{Dataset, DatasetKind, ImageGrid},
};

fn kind_name(kind: DatasetKind) -> &'static str {
    match kind {
        DatasetKind::PointCloud => "point_cloud",
        DatasetKind::UnstructuredMesh => "unstructured_mesh",
        DatasetKind::ImageGrid => "image_grid",
        DatasetKind::Graph => "graph",
    }
}

fn kind_from_name(name: &str) -> Result<DatasetKind> {
    match name {
        "point_cloud" => Ok(DatasetKind::PointCloud),
        "unstructured_mesh" => Ok(DatasetKind::UnstructuredMesh),
        "image_grid" => Ok(DatasetKind::ImageGrid),
        "graph" => Ok(DatasetKind::Graph),
        other => Err(Error::Header(format!("unknown dataset kind {}", other))),
    }
}

fn header(dataset: &Dataset) -> String {
    let mut line = format!(
        "kind={} points={} cells={}",
        kind_name(dataset.kind()),
        dataset.number_of_points(),
        dataset.number_of_cells()
    );
    if let Dataset::ImageGrid(grid) = dataset {
        line.push_str(&format!(
            " extent={} origin={} spacing={}",
            grid.extent.iter().join(","),
            grid.origin.iter().join(","),
            grid.spacing.iter().join(",")
        ));
    }
    line.push('\n');
    line
}

fn parse_list<T, const N: usize>(fields: &HashMap<&str, &str>, key: &str) -> Result<[T; N]>
where
    T: std::str::FromStr + Copy + Default,
{
    let raw = fields
        .get(key)
        .ok_or_else(|| Error::Header(format!("missing {}", key)))?;
    let items: Vec<&str> = raw.split(',').collect();
    if items.len() != N {
        return Err(Error::Header(format!("{} needs {} entries", key, N)));
    }
    let mut values = [T::default(); N];
    for (slot, item) in values.iter_mut().zip(items) {
        *slot = item
            .parse()
            .map_err(|_| Error::Header(format!("bad {} entry {}", key, item)))?;
    }
    Ok(values)
}

/// The zlib frame stores the original length in 4 bytes.
fn frame_length(len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| Error::Header(format!("{} bytes do not fit a zlib frame", len)))
}

fn compress(block: &[u8], level: u32) -> Result<Vec<u8>> {
    let length = frame_length(block.len())?;
    let mut framed = Vec::with_capacity(ZLIB_HEADER_LEN + block.len() / 2);
    framed.extend_from_slice(ZLIB_MAGIC);
    framed.extend_from_slice(&length.to_le_bytes());
    let mut encoder = ZlibEncoder::new(framed, Compression::new(level));
    encoder.write_all(block)?;
    Ok(encoder.finish()?)
}

fn decompress(block: &[u8]) -> Result<Vec<u8>> {
    let mut length = [0u8; 4];
    length.copy_from_slice(&block[ZLIB_MAGIC.len()..ZLIB_HEADER_LEN]);
    let mut raw = Vec::with_capacity(u32::from_le_bytes(length) as usize);
    ZlibDecoder::new(&block[ZLIB_HEADER_LEN..]).read_to_end(&mut raw)?;
    Ok(raw)
}

pub fn is_compressed(block: &[u8]) -> bool {
    block.len() >= ZLIB_HEADER_LEN && block.starts_with(ZLIB_MAGIC)
}

/// Serialise one dataset into a block, compressed when `level` is given.
pub fn marshal(dataset: &Dataset, level: Option<u32>) -> Result<Vec<u8>> {
    let mut block = header(dataset).into_bytes();
    serde_json::to_writer(&mut block, dataset)?;
    match level {
        Some(level) => compress(&block, level),
        None => Ok(block),
    }
}

pub fn unmarshal(block: &[u8]) -> Result<Dataset> {
    let inflated;
    let block = if is_compressed(block) {
        inflated = decompress(block)?;
        &inflated[..]
    } else {
        block
    };

    let split = block
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| Error::Header("missing header line".to_string()))?;
    let line = std::str::from_utf8(&block[..split]).map_err(|e| Error::Header(e.to_string()))?;
    let fields: HashMap<&str, &str> = line.split_whitespace().filter_map(|f| f.split_once('=')).collect();

    let kind = kind_from_name(
        fields
            .get("kind")
            .ok_or_else(|| Error::Header("missing kind".to_string()))?,
    )?;

    let mut dataset: Dataset = serde_json::from_slice(&block[split + 1..])?;
    if dataset.kind() != kind {
        return Err(Error::Header(format!(
            "header says {} but payload holds {}",
            kind_name(kind),
            kind_name(dataset.kind())
        )));
    }
    if let Dataset::ImageGrid(grid) = &mut dataset {
        *grid = ImageGrid::new(
            parse_list(&fields, "extent")?,
            parse_list(&fields, "origin")?,
            parse_list(&fields, "spacing")?,
            std::mem::take(&mut grid.scalars),
        );
    }
    Ok(dataset)
}

/// The blocks of one move operation, one per contributing dataset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireBuffer {
    blocks: Vec<Vec<u8>>,
}

impl WireBuffer {
    pub fn new() -> Self {
        WireBuffer::default()
    }

    pub fn from_dataset(dataset: &Dataset, level: Option<u32>) -> Result<Self> {
        Ok(WireBuffer {
            blocks: vec![marshal(dataset, level)?],
        })
    }

    pub fn push(&mut self, block: Vec<u8>) {
        self.blocks.push(block);
    }

    pub fn push_dataset(&mut self, dataset: &Dataset, level: Option<u32>) -> Result<()> {
        self.blocks.push(marshal(dataset, level)?);
        Ok(())
    }

    /// Append the blocks of `other` after this buffer's blocks.
    pub fn append(&mut self, other: WireBuffer) {
        self.blocks.extend(other.blocks);
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[Vec<u8>] {
        &self.blocks
    }

    /// Total bytes over all blocks.
    pub fn byte_size(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        pack_blocks(&self.blocks)
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        WireBuffer {
            blocks: unpack_blocks(bytes),
        }
    }

    /// Decode every block and merge the datasets in block order.
    pub fn reconstruct(&self) -> Result<Option<Dataset>> {
        let pieces = self
            .blocks
            .iter()
            .map(|block| unmarshal(block))
            .collect::<Result<Vec<_>>>()?;
        Dataset::merge(pieces)
    }
}
