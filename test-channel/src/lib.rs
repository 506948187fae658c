//! Unreliable lower flows for testing purposes.
#![deny(missing_docs)]
use async_trait::async_trait;
use channel::{wait_until, Channel, ChannelId, TryWriteError};
use pdu::Buf;
use rand::rngs::OsRng;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

struct Direction {
    queue: VecDeque<Buf>,
    delayed: VecDeque<Buf>,
    closed: bool,
}

impl Direction {
    fn new() -> Arc<Mutex<Direction>> {
        Arc::new(Mutex::new(Direction {
            queue: VecDeque::new(),
            delayed: VecDeque::new(),
            closed: false,
        }))
    }
}

/// One end of an in-memory duplex pipe between two IPCPs.
///
/// The transmit side is a bounded lower flow; the receive side hands out
/// what the peer wrote, for pumping into the local IPCP. The `px`
/// parameter is the probability of a written PDU being transmitted, `pq`
/// the probability of it being queued for a later, duplicated delivery.
/// `px=1, pq=0` is a reliable pipe, `px=1, pq=1` delivers everything
/// twice, `px=0, pq=0` is a network partition.
pub struct Pipe {
    tx: Arc<Mutex<Direction>>,
    rx: Arc<Mutex<Direction>>,
    capacity: usize,
    px: f64,
    pq: f64,
    id: ChannelId,
}

impl Pipe {
    /// Creates a reliable pair of pipe ends with the given queue bound.
    pub fn pair(capacity: usize) -> (Pipe, Pipe) {
        Pipe::lossy_pair(capacity, 1.0, 0.0)
    }

    /// Creates a pair of pipe ends with loss and duplication knobs.
    pub fn lossy_pair(capacity: usize, px: f64, pq: f64) -> (Pipe, Pipe) {
        assert!((0.0..=1.0).contains(&px));
        assert!((0.0..=1.0).contains(&pq));
        let ab = Direction::new();
        let ba = Direction::new();
        let a = Pipe {
            tx: ab.clone(),
            rx: ba.clone(),
            capacity,
            px,
            pq,
            id: ChannelId::next(),
        };
        let b = Pipe {
            tx: ba,
            rx: ab,
            capacity,
            px,
            pq,
            id: ChannelId::next(),
        };
        (a, b)
    }

    /// Takes the next PDU written by the peer, if any. Delayed duplicates
    /// are released into the queue afterwards, so they arrive out of
    /// order, like the network reordering they simulate.
    pub fn try_recv(&self) -> Option<Buf> {
        let mut rx = self.rx.lock().unwrap();
        let rb = rx.queue.pop_front()?;
        while let Some(delayed) = rx.delayed.pop_front() {
            rx.queue.push_back(delayed);
        }
        Some(rb)
    }

    /// Waits for the next PDU from the peer; `None` once the pipe closes.
    pub async fn recv(&self) -> Option<Buf> {
        loop {
            if let Some(rb) = self.try_recv() {
                return Some(rb);
            }
            if self.rx.lock().unwrap().closed {
                return None;
            }
            let rx = self.rx.clone();
            wait_until(move || {
                let rx = rx.lock().unwrap();
                !rx.queue.is_empty() || rx.closed
            })
            .await;
        }
    }

    /// Closes both directions; readers and writers observe it.
    pub fn close(&self) {
        self.tx.lock().unwrap().closed = true;
        self.rx.lock().unwrap().closed = true;
    }
}

#[async_trait]
impl Channel for Pipe {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn try_write(&self, rb: Buf) -> Result<(), TryWriteError> {
        let mut tx = self.tx.lock().unwrap();
        if tx.closed {
            return Err(TryWriteError::Closed(rb));
        }
        if tx.queue.len() >= self.capacity {
            return Err(TryWriteError::Full(rb));
        }
        let fate: f64 = OsRng.gen();
        if fate < self.pq {
            tx.delayed.push_back(rb.clone());
        }
        if fate < self.px {
            tx.queue.push_back(rb);
        }
        Ok(())
    }

    async fn writable(&self) {
        let tx = self.tx.clone();
        let capacity = self.capacity;
        wait_until(move || {
            let tx = tx.lock().unwrap();
            tx.queue.len() < capacity || tx.closed
        })
        .await;
    }
}
