//! In-process process groups: one thread per rank, mailboxes instead of a network.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;

use tracing::trace;

use crate::comm::{Communicator, Rank, Tag};

#[derive(Default)]
struct Mailbox {
    queues: Mutex<HashMap<(Rank, Tag), VecDeque<Vec<u8>>>>,
    arrived: Condvar,
}

/// A rank of an in-process group created by [`LocalUniverse`].
///
/// Sends are buffered and never block; receives block until a matching message
/// arrives, which reproduces the hang of an unmatched MPI receive.
#[derive(Clone)]
pub struct LocalCommunicator {
    rank: Rank,
    mailboxes: Arc<Vec<Mailbox>>,
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> Rank {
        self.mailboxes.len() as Rank
    }

    fn send(&self, dest: Rank, tag: Tag, data: &[u8]) {
        trace!(source = self.rank, dest, tag, bytes = data.len(), "local send");
        let mailbox = &self.mailboxes[dest as usize];
        let mut queues = mailbox.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues
            .entry((self.rank, tag))
            .or_default()
            .push_back(data.to_vec());
        mailbox.arrived.notify_all();
    }

    fn receive(&self, source: Rank, tag: Tag) -> Vec<u8> {
        let mailbox = &self.mailboxes[self.rank as usize];
        let mut queues = mailbox.queues.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(message) = queues.get_mut(&(source, tag)).and_then(VecDeque::pop_front) {
                return message;
            }
            queues = mailbox
                .arrived
                .wait(queues)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Factory for in-process process groups.
pub struct LocalUniverse;

impl LocalUniverse {
    /// Create the communicators of a group of `size` ranks.
    pub fn communicators(size: usize) -> Vec<LocalCommunicator> {
        let mailboxes: Arc<Vec<Mailbox>> = Arc::new((0..size).map(|_| Mailbox::default()).collect());
        (0..size)
            .map(|rank| LocalCommunicator {
                rank: rank as Rank,
                mailboxes: Arc::clone(&mailboxes),
            })
            .collect()
    }

    /// Run `f` once per rank, each on its own thread, and return the results in rank order.
    pub fn run<F, R>(size: usize, f: F) -> Vec<R>
    where
        F: Fn(LocalCommunicator) -> R + Sync,
        R: Send,
    {
        let communicators = Self::communicators(size);
        thread::scope(|scope| {
            let handles: Vec<_> = communicators
                .into_iter()
                .map(|comm| {
                    let f = &f;
                    scope.spawn(move || f(comm))
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        })
    }
}
