//! Defines the `Channel` trait, the contract between an IPCP and the
//! lower flows it relays PDUs onto.
#![deny(missing_docs)]
use async_trait::async_trait;
use pdu::Buf;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Process-unique identity of a lower flow.
///
/// Forwarding entries are indexed against this identity so that tearing a
/// flow down can unlink everything that still points at it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Allocates a fresh identity.
    pub fn next() -> ChannelId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ChannelId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A write attempt that could not take the buffer.
///
/// Ownership of the PDU travels back to the caller in both variants, so a
/// buffer is never lost to backpressure.
#[derive(Debug)]
pub enum TryWriteError {
    /// The flow has no transmit credit right now; try again later.
    Full(Buf),
    /// The flow is gone and will not accept further writes.
    Closed(Buf),
}

/// A lower flow an IPCP can write PDUs onto.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Identity used to link forwarding entries against this flow.
    fn id(&self) -> ChannelId;

    /// Attempts to write a PDU without blocking.
    fn try_write(&self, rb: Buf) -> Result<(), TryWriteError>;

    /// Waits until the flow is likely to accept another write.
    async fn writable(&self);
}

/// Cooperatively waits until `cond` returns true.
///
/// The future re-wakes itself after every unsuccessful poll, yielding to
/// the executor in between.
pub async fn wait_until<F>(cond: F)
where
    F: Fn() -> bool + Send + Unpin,
{
    WaitUntil(cond).await
}

struct WaitUntil<F>(F);

impl<F: Fn() -> bool + Send + Unpin> Future for WaitUntil<F> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        if (self.get_mut().0)() {
            Poll::Ready(())
        } else {
            cx.waker().clone().wake();
            Poll::Pending
        }
    }
}

/// Lets an event through at most once per interval.
///
/// Used to keep receive path drops from flooding the log.
pub struct RateLimit {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimit {
    /// Creates a limiter allowing one event per `interval`.
    pub fn new(interval: Duration) -> RateLimit {
        RateLimit {
            interval,
            last: Mutex::new(None),
        }
    }

    /// True when the caller may log this occurrence.
    pub fn check(&self) -> bool {
        let mut last = self.last.lock().unwrap();
        let now = Instant::now();
        match *last {
            Some(t) if now < t + self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// A loopback lower flow with a bounded queue.
///
/// Writes park PDUs in memory for a local reader; a full queue reports
/// [`TryWriteError::Full`] the way a congested flow would.
#[derive(Clone)]
pub struct Loopback {
    queue: Arc<Mutex<VecDeque<Buf>>>,
    capacity: usize,
    id: ChannelId,
}

impl Loopback {
    /// Creates a loopback holding at most `capacity` PDUs.
    pub fn new(capacity: usize) -> Loopback {
        Loopback {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            capacity,
            id: ChannelId::next(),
        }
    }

    /// Takes the next queued PDU if there is one.
    pub fn try_recv(&self) -> Option<Buf> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Waits for the next queued PDU.
    pub async fn recv(&self) -> Buf {
        loop {
            if let Some(rb) = self.try_recv() {
                return rb;
            }
            let queue = self.queue.clone();
            wait_until(move || !queue.lock().unwrap().is_empty()).await;
        }
    }

    /// Number of PDUs currently queued.
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Channel for Loopback {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn try_write(&self, rb: Buf) -> Result<(), TryWriteError> {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.capacity {
            return Err(TryWriteError::Full(rb));
        }
        queue.push_back(rb);
        Ok(())
    }

    async fn writable(&self) {
        let queue = self.queue.clone();
        let capacity = self.capacity;
        wait_until(move || queue.lock().unwrap().len() < capacity).await;
    }
}
