//! Point-to-point messaging between the processes of one group.
//!
//! Everything above this layer (sub-group collectives, the partition-tree builder and the
//! data mover) is written against the [`Communicator`] trait, so the same code runs over
//! MPI (feature `mpi`) or over the in-process [`local::LocalUniverse`] used by the tests.
pub mod channel;
pub mod local;
#[cfg(feature = "mpi")]
pub mod mpi;

/// Rank of a process inside its group, as in MPI.
pub type Rank = i32;

/// Message tag, as in MPI.
pub type Tag = i32;

/// Blocking, tagged point-to-point messaging inside one process group.
///
/// Messages sent from one rank to another with the same tag are received in the order
/// they were sent.
pub trait Communicator {
    fn rank(&self) -> Rank;

    fn size(&self) -> Rank;

    fn send(&self, dest: Rank, tag: Tag, data: &[u8]);

    /// Block until the next message from `source` carrying `tag` arrives.
    fn receive(&self, source: Rank, tag: Tag) -> Vec<u8>;
}

impl<C: Communicator + ?Sized> Communicator for &C {
    fn rank(&self) -> Rank {
        (**self).rank()
    }

    fn size(&self) -> Rank {
        (**self).size()
    }

    fn send(&self, dest: Rank, tag: Tag, data: &[u8]) {
        (**self).send(dest, tag, data)
    }

    fn receive(&self, source: Rank, tag: Tag) -> Vec<u8> {
        (**self).receive(source, tag)
    }
}

/// Fixed-size values that travel as little-endian bytes.
pub trait Scalar: Copy + Default + PartialOrd + Send + 'static {
    const SIZE: usize;

    fn write_le(&self, out: &mut Vec<u8>);

    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_scalar {
    ($($t:ty),*) => {
        $(
            impl Scalar for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                fn write_le(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$t>()];
                    buf.copy_from_slice(&bytes[..Self::SIZE]);
                    <$t>::from_le_bytes(buf)
                }
            }
        )*
    };
}

impl_scalar!(f64, i64, i32, u64, u32, usize);

pub fn encode<T: Scalar>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * T::SIZE);
    for value in values {
        value.write_le(&mut out);
    }
    out
}

pub fn decode<T: Scalar>(bytes: &[u8]) -> Vec<T> {
    bytes.chunks_exact(T::SIZE).map(T::read_le).collect()
}

/// Concatenate byte blocks as `count u64 | lengths u64.. | bytes..`.
pub fn pack_blocks<B: AsRef<[u8]>>(blocks: &[B]) -> Vec<u8> {
    let total: usize = blocks.iter().map(|b| b.as_ref().len()).sum();
    let mut out = Vec::with_capacity(8 * (blocks.len() + 1) + total);
    (blocks.len() as u64).write_le(&mut out);
    for block in blocks {
        (block.as_ref().len() as u64).write_le(&mut out);
    }
    for block in blocks {
        out.extend_from_slice(block.as_ref());
    }
    out
}

/// Inverse of [`pack_blocks`]. A truncated buffer yields the blocks that fit.
pub fn unpack_blocks(bytes: &[u8]) -> Vec<Vec<u8>> {
    if bytes.len() < 8 {
        return Vec::new();
    }
    let count = u64::read_le(bytes) as usize;
    let header = 8 * (count + 1);
    if bytes.len() < header {
        return Vec::new();
    }

    let mut blocks = Vec::with_capacity(count);
    let mut offset = header;
    for i in 0..count {
        let len = u64::read_le(&bytes[8 * (i + 1)..]) as usize;
        let end = (offset + len).min(bytes.len());
        blocks.push(bytes[offset..end].to_vec());
        offset = end;
    }
    blocks
}
