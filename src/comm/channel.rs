//! Socket channels between the process groups of different roles.
//!
//! A channel carries several logical streams; each message has a fixed tag and a receive
//! for one tag buffers messages of other tags that arrive first.
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, Sender};

use tracing::{debug, trace};

use crate::{comm::Scalar, error::Result};

pub trait Channel: Send {
    fn send(&mut self, tag: u32, data: &[u8]) -> Result<()>;

    /// Block until the next message with `tag` arrives.
    fn receive(&mut self, tag: u32) -> Result<Vec<u8>>;
}

/// Messages that arrived ahead of the tag currently waited for.
#[derive(Default)]
struct Pending {
    queue: VecDeque<(u32, Vec<u8>)>,
}

impl Pending {
    fn take(&mut self, tag: u32) -> Option<Vec<u8>> {
        let index = self.queue.iter().position(|(t, _)| *t == tag)?;
        self.queue.remove(index).map(|(_, data)| data)
    }

    fn push(&mut self, tag: u32, data: Vec<u8>) {
        self.queue.push_back((tag, data));
    }
}

/// One end of an in-process channel.
pub struct LocalChannel {
    tx: Sender<(u32, Vec<u8>)>,
    rx: Receiver<(u32, Vec<u8>)>,
    pending: Pending,
}

impl LocalChannel {
    pub fn pair() -> (LocalChannel, LocalChannel) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        (
            LocalChannel {
                tx: a_tx,
                rx: a_rx,
                pending: Pending::default(),
            },
            LocalChannel {
                tx: b_tx,
                rx: b_rx,
                pending: Pending::default(),
            },
        )
    }
}

fn disconnected() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "channel peer disconnected")
}

impl Channel for LocalChannel {
    fn send(&mut self, tag: u32, data: &[u8]) -> Result<()> {
        trace!(tag, bytes = data.len(), "channel send");
        self.tx
            .send((tag, data.to_vec()))
            .map_err(|_| disconnected().into())
    }

    fn receive(&mut self, tag: u32) -> Result<Vec<u8>> {
        if let Some(data) = self.pending.take(tag) {
            return Ok(data);
        }
        loop {
            let (t, data) = self.rx.recv().map_err(|_| disconnected())?;
            if t == tag {
                return Ok(data);
            }
            self.pending.push(t, data);
        }
    }
}

/// Channel over a TCP stream. Frames are `tag u32 | length u64 | bytes`, little endian.
pub struct TcpChannel {
    stream: TcpStream,
    pending: Pending,
}

impl TcpChannel {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<TcpChannel> {
        let stream = TcpStream::connect(addr)?;
        debug!(peer = ?stream.peer_addr().ok(), "channel connected");
        Self::from_stream(stream)
    }

    /// Wait for one peer on `listener`.
    pub fn accept(listener: &TcpListener) -> Result<TcpChannel> {
        let (stream, peer) = listener.accept()?;
        debug!(%peer, "channel accepted");
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Result<TcpChannel> {
        stream.set_nodelay(true)?;
        Ok(TcpChannel {
            stream,
            pending: Pending::default(),
        })
    }

    fn read_frame(&mut self) -> Result<(u32, Vec<u8>)> {
        let mut header = [0u8; 12];
        self.stream.read_exact(&mut header)?;
        let tag = u32::read_le(&header[..4]);
        let len = u64::read_le(&header[4..]) as usize;
        let mut data = vec![0u8; len];
        self.stream.read_exact(&mut data)?;
        Ok((tag, data))
    }
}

impl Channel for TcpChannel {
    fn send(&mut self, tag: u32, data: &[u8]) -> Result<()> {
        let mut header = Vec::with_capacity(12);
        tag.write_le(&mut header);
        (data.len() as u64).write_le(&mut header);
        self.stream.write_all(&header)?;
        self.stream.write_all(data)?;
        self.stream.flush()?;
        Ok(())
    }

    fn receive(&mut self, tag: u32) -> Result<Vec<u8>> {
        if let Some(data) = self.pending.take(tag) {
            return Ok(data);
        }
        loop {
            let (t, data) = self.read_frame()?;
            if t == tag {
                return Ok(data);
            }
            self.pending.push(t, data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_local_channel_tags() {
        let (mut a, mut b) = LocalChannel::pair();
        a.send(1, b"one").unwrap();
        a.send(2, b"two").unwrap();
        assert_eq!(b.receive(2).unwrap(), b"two".to_vec());
        assert_eq!(b.receive(1).unwrap(), b"one".to_vec());

        drop(a);
        assert!(b.receive(1).is_err());
    }

    #[test]
    fn test_tcp_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let mut channel = TcpChannel::accept(&listener).unwrap();
            let first = channel.receive(9).unwrap();
            channel.send(3, &first).unwrap();
        });

        let mut client = TcpChannel::connect(addr).unwrap();
        client.send(4, b"ignored").unwrap();
        client.send(9, b"payload").unwrap();
        assert_eq!(client.receive(3).unwrap(), b"payload".to_vec());
        server.join().unwrap();
    }
}
