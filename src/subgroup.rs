//! Collectives over a contiguous slice `[lo, hi]` of a group's ranks.
//!
//! Members are addressed by their rank inside the slice. Broadcasts, reductions and
//! gathers run over a binary fan-in tree rooted at the requested member, so a slice of
//! `n` members finishes in `ceil(log2 n)` rounds.
//!
//! Every member of the slice must issue the same operations in the same order. There is
//! no buffering across mismatched call sequences: one member that skips a call hangs the
//! whole slice.
use itertools::Itertools;
use tracing::{trace, warn};

use crate::{
    comm::{decode, encode, pack_blocks, unpack_blocks, Communicator, Rank, Scalar, Tag},
    error::{Error, Result},
};

pub struct SubGroup<'a, C: Communicator> {
    comm: &'a C,
    lo: Rank,
    tag: Tag,
    me: usize,
    n: usize,
}

/// Shape of a fixed-length gather, computed once by [`SubGroup::set_up_root`] and reused
/// for every gather with the same root and length.
#[derive(Debug, Clone, PartialEq)]
pub struct GatherPattern {
    root: usize,
    length: usize,
    /// Children in the fan-in tree as (relative rank, members in the child's subtree).
    children: Vec<(usize, usize)>,
    parent: Option<usize>,
}

impl GatherPattern {
    pub fn root(&self) -> usize {
        self.root
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Members whose values pass through this member, itself included.
    pub fn subtree_members(&self) -> usize {
        1 + self.children.iter().map(|&(_, members)| members).sum::<usize>()
    }
}

/// Children (relative ranks, increasing distance) and parent of `rel` in the fan-in tree.
fn fan_in(rel: usize, n: usize) -> (Vec<usize>, Option<usize>) {
    let mut children = Vec::new();
    let mut step = 1;
    while step < n {
        if rel & step != 0 {
            return (children, Some(rel - step));
        }
        if rel + step < n {
            children.push(rel + step);
        }
        step <<= 1;
    }
    (children, None)
}

/// Merge two sorted lists, dropping duplicates.
pub fn merge_sorted_unique<T: Ord + Copy>(a: &[T], b: &[T]) -> Vec<T> {
    a.iter().merge(b.iter()).dedup().copied().collect()
}

impl<'a, C: Communicator> SubGroup<'a, C> {
    /// Slice `[lo, hi]` of `comm`'s ranks. The calling process must be a member.
    pub fn new(comm: &'a C, lo: Rank, hi: Rank, tag: Tag) -> Result<Self> {
        let rank = comm.rank();
        if lo < 0 || hi >= comm.size() || lo > hi {
            return Err(Error::InvalidProcess(if lo < 0 { lo } else { hi }));
        }
        if rank < lo || rank > hi {
            return Err(Error::InvalidProcess(rank));
        }
        Ok(SubGroup {
            comm,
            lo,
            tag,
            me: (rank - lo) as usize,
            n: (hi - lo + 1) as usize,
        })
    }

    /// Slice spanning every rank of `comm`.
    pub fn whole(comm: &'a C, tag: Tag) -> Result<Self> {
        Self::new(comm, 0, comm.size() - 1, tag)
    }

    pub fn communicator(&self) -> &'a C {
        self.comm
    }

    /// Rank of the calling process inside the slice.
    pub fn member_rank(&self) -> usize {
        self.me
    }

    pub fn members(&self) -> usize {
        self.n
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Rank in the underlying communicator of slice member `member`.
    pub fn global_rank(&self, member: usize) -> Rank {
        self.lo + member as Rank
    }

    fn relative(&self, root: usize) -> usize {
        (self.me + self.n - root) % self.n
    }

    fn absolute(&self, rel: usize, root: usize) -> Rank {
        self.global_rank((rel + root) % self.n)
    }

    /// Combine byte payloads up the fan-in tree; the root gets the combined value.
    fn fold_to_root<F>(&self, data: Vec<u8>, root: usize, combine: F) -> Option<Vec<u8>>
    where
        F: Fn(Vec<u8>, Vec<u8>) -> Vec<u8>,
    {
        let rel = self.relative(root);
        let (children, parent) = fan_in(rel, self.n);
        let mut acc = data;
        for child in children {
            let incoming = self.comm.receive(self.absolute(child, root), self.tag);
            acc = combine(acc, incoming);
        }
        match parent {
            Some(parent) => {
                self.comm.send(self.absolute(parent, root), self.tag, &acc);
                None
            }
            None => Some(acc),
        }
    }

    /// Broadcast bytes from member `root`. The argument is ignored on other members.
    pub fn broadcast_bytes(&self, data: &[u8], root: usize) -> Vec<u8> {
        let rel = self.relative(root);
        let (children, parent) = fan_in(rel, self.n);
        let data = match parent {
            Some(parent) => self.comm.receive(self.absolute(parent, root), self.tag),
            None => data.to_vec(),
        };
        for &child in children.iter().rev() {
            self.comm.send(self.absolute(child, root), self.tag, &data);
        }
        data
    }

    pub fn broadcast<T: Scalar>(&self, data: &[T], root: usize) -> Vec<T> {
        decode(&self.broadcast_bytes(&encode(data), root))
    }

    fn reduce_with<T, F>(&self, data: &[T], root: usize, op: F) -> Option<Vec<T>>
    where
        T: Scalar,
        F: Fn(T, T) -> T,
    {
        trace!(lo = self.lo, n = self.n, tag = self.tag, root, "reduce");
        self.fold_to_root(encode(data), root, |acc, incoming| {
            let mut acc: Vec<T> = decode(&acc);
            for (a, b) in acc.iter_mut().zip(decode::<T>(&incoming)) {
                *a = op(*a, b);
            }
            encode(&acc)
        })
        .map(|bytes| decode(&bytes))
    }

    /// Element-wise minimum, delivered to `root` only.
    pub fn reduce_min<T: Scalar>(&self, data: &[T], root: usize) -> Option<Vec<T>> {
        self.reduce_with(data, root, |a, b| if b < a { b } else { a })
    }

    pub fn reduce_max<T: Scalar>(&self, data: &[T], root: usize) -> Option<Vec<T>> {
        self.reduce_with(data, root, |a, b| if b > a { b } else { a })
    }

    pub fn reduce_sum<T: Scalar + std::ops::Add<Output = T>>(
        &self,
        data: &[T],
        root: usize,
    ) -> Option<Vec<T>> {
        self.reduce_with(data, root, |a, b| a + b)
    }

    fn all_reduce_with<T, F>(&self, data: &[T], op: F) -> Vec<T>
    where
        T: Scalar,
        F: Fn(T, T) -> T,
    {
        let reduced = self.reduce_with(data, 0, op).unwrap_or_default();
        self.broadcast(&reduced, 0)
    }

    pub fn all_reduce_min<T: Scalar>(&self, data: &[T]) -> Vec<T> {
        self.all_reduce_with(data, |a, b| if b < a { b } else { a })
    }

    pub fn all_reduce_max<T: Scalar>(&self, data: &[T]) -> Vec<T> {
        self.all_reduce_with(data, |a, b| if b > a { b } else { a })
    }

    pub fn all_reduce_sum<T: Scalar + std::ops::Add<Output = T>>(&self, data: &[T]) -> Vec<T> {
        self.all_reduce_with(data, |a, b| a + b)
    }

    pub fn barrier(&self) {
        let empty: [u8; 0] = [];
        let _ = self.fold_to_root(empty.to_vec(), 0, |acc, _| acc);
        self.broadcast_bytes(&empty, 0);
    }

    /// Prepare repeated gathers of `length` values per member onto `root`.
    pub fn set_up_root(&self, root: usize, length: usize) -> GatherPattern {
        let rel = self.relative(root);
        let (children, parent) = fan_in(rel, self.n);
        let children = children
            .into_iter()
            .map(|child| {
                let step = child - rel;
                (child, step.min(self.n - child))
            })
            .collect();
        GatherPattern {
            root,
            length,
            children,
            parent,
        }
    }

    /// Gather `pattern.length()` values from every member; the root receives them in
    /// member order.
    pub fn gather<T: Scalar>(&self, pattern: &GatherPattern, data: &[T]) -> Option<Vec<T>> {
        debug_assert_eq!(data.len(), pattern.length);
        let root = pattern.root;
        let block = pattern.length * T::SIZE;
        let mut buffer = Vec::with_capacity(pattern.subtree_members() * block);
        buffer.extend_from_slice(&encode(data));
        buffer.resize(block, 0);
        for &(child, members) in pattern.children.iter() {
            let mut incoming = self.comm.receive(self.absolute(child, root), self.tag);
            // A child's subtree forwards exactly `members` blocks, keep later members aligned.
            if incoming.len() != members * block {
                warn!(
                    child,
                    expected = members * block,
                    received = incoming.len(),
                    "gather block of unexpected size"
                );
                incoming.resize(members * block, 0);
            }
            buffer.extend(incoming);
        }
        if let Some(parent) = pattern.parent {
            self.comm.send(self.absolute(parent, root), self.tag, &buffer);
            return None;
        }

        // Blocks arrive ordered by relative rank; rotate back to member order.
        let relative_order: Vec<T> = decode(&buffer);
        let length = pattern.length;
        let mut gathered = vec![T::default(); self.n * length];
        for member in 0..self.n {
            let rel = (member + self.n - root) % self.n;
            gathered[member * length..(member + 1) * length]
                .copy_from_slice(&relative_order[rel * length..(rel + 1) * length]);
        }
        Some(gathered)
    }

    /// Gather byte blocks of any length; the root receives them in member order.
    pub fn gather_bytes(&self, data: &[u8], root: usize) -> Option<Vec<Vec<u8>>> {
        let rel = self.relative(root);
        let (children, parent) = fan_in(rel, self.n);

        let mut blocks = vec![data.to_vec()];
        for child in children {
            blocks.extend(unpack_blocks(
                &self.comm.receive(self.absolute(child, root), self.tag),
            ));
        }
        if let Some(parent) = parent {
            self.comm
                .send(self.absolute(parent, root), self.tag, &pack_blocks(&blocks));
            return None;
        }
        blocks.rotate_right(root);
        Some(blocks)
    }

    pub fn all_gather_bytes(&self, data: &[u8]) -> Vec<Vec<u8>> {
        let packed = self
            .gather_bytes(data, 0)
            .map(|blocks| pack_blocks(&blocks))
            .unwrap_or_default();
        unpack_blocks(&self.broadcast_bytes(&packed, 0))
    }

    /// Every member's values, indexed by member rank, on every member.
    pub fn all_gather<T: Scalar>(&self, data: &[T]) -> Vec<Vec<T>> {
        self.all_gather_bytes(&encode(data))
            .iter()
            .map(|bytes| decode(bytes))
            .collect()
    }

    /// Union of every member's id list as one sorted, duplicate-free list.
    pub fn all_reduce_unique_list(&self, list: &[i64]) -> Vec<i64> {
        let mut local = list.to_vec();
        local.sort_unstable();
        local.dedup();

        let merged = self
            .fold_to_root(encode(&local), 0, |acc, incoming| {
                encode(&merge_sorted_unique(
                    &decode::<i64>(&acc),
                    &decode::<i64>(&incoming),
                ))
            })
            .unwrap_or_default();
        decode(&self.broadcast_bytes(&merged, 0))
    }

    /// All-to-all exchange: `outgoing[m]` goes to member `m`, the result holds what each
    /// member sent here.
    ///
    /// Messages to higher members are exchanged first, each member receiving from every
    /// lower member before sending upwards, then the same descending. Both phases are
    /// deadlock free even when sends block until matched.
    pub fn exchange(&self, mut outgoing: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        debug_assert_eq!(outgoing.len(), self.n);
        outgoing.resize(self.n, Vec::new());
        let mut incoming = vec![Vec::new(); self.n];
        incoming[self.me] = std::mem::take(&mut outgoing[self.me]);

        for source in 0..self.me {
            incoming[source] = self.comm.receive(self.global_rank(source), self.tag);
        }
        for dest in self.me + 1..self.n {
            self.comm
                .send(self.global_rank(dest), self.tag, &outgoing[dest]);
        }

        for source in (self.me + 1..self.n).rev() {
            incoming[source] = self.comm.receive(self.global_rank(source), self.tag);
        }
        for dest in (0..self.me).rev() {
            self.comm
                .send(self.global_rank(dest), self.tag, &outgoing[dest]);
        }
        incoming
    }

    pub fn exchange_values<T: Scalar>(&self, outgoing: Vec<Vec<T>>) -> Vec<Vec<T>> {
        self.exchange(outgoing.iter().map(|values| encode(values)).collect())
            .iter()
            .map(|bytes| decode(bytes))
            .collect()
    }
}
