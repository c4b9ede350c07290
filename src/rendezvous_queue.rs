use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::error::RpmsgError;
use crate::transport::{RxDisposition, RxHandler, RxMessage, Transport};

/// The hand-over point between the transport's delivery context (the single producer, calling
///  [RxHandler::on_receive]) and the session worker (the single consumer).
///
/// The queue is a fixed-capacity ring of [RxMessage]s. Entries are tickets for buffers in
///  transport-owned storage rather than copies, so a queued message keeps its rx buffer until
///  the consumer releases it.
///
/// Pushing never waits: if the ring is full, the message is rejected and the delivery context
///  tells the transport to keep the buffer and retry later.
pub struct RendezvousQueue {
    transport: Arc<dyn Transport>,
    capacity: usize,
    entries: Mutex<QueueEntries>,
    available: Notify,
}

struct QueueEntries {
    ring: VecDeque<RxMessage>,
    closed: bool,
}

impl Debug for RendezvousQueue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RendezvousQueue{{capacity:{}, len:{}}}", self.capacity, self.len())
    }
}

impl RendezvousQueue {
    pub fn create(transport: Arc<dyn Transport>, capacity: usize) -> Arc<RendezvousQueue> {
        assert!(capacity > 0, "a rendezvous queue needs a capacity of at least one message");

        debug!("creating rendezvous queue with capacity {}", capacity);
        Arc::new(RendezvousQueue {
            transport,
            capacity,
            entries: Mutex::new(QueueEntries {
                ring: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            available: Notify::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Non-blocking. Fails with [RpmsgError::QueueFull] if the queue is at capacity, and with
    ///  [RpmsgError::QueueClosed] after [RendezvousQueue::destroy].
    pub fn push(&self, msg: RxMessage) -> Result<(), RpmsgError> {
        {
            let mut entries = self.lock();
            if entries.closed {
                return Err(RpmsgError::QueueClosed);
            }
            if entries.ring.len() == self.capacity {
                return Err(RpmsgError::QueueFull);
            }
            entries.ring.push_back(msg);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Take the oldest message off the queue, waiting for one to arrive if the queue is empty.
    ///  `None` waits indefinitely.
    ///
    /// The caller owns the message's rx buffer and must hand it back with
    ///  [RendezvousQueue::release].
    pub async fn pop(&self, timeout: Option<Duration>) -> Result<RxMessage, RpmsgError> {
        match timeout {
            None => self.pop_blocking().await,
            Some(timeout) => tokio::time::timeout(timeout, self.pop_blocking()).await
                .map_err(|_| RpmsgError::TimedOut)?,
        }
    }

    async fn pop_blocking(&self) -> Result<RxMessage, RpmsgError> {
        loop {
            {
                let mut entries = self.lock();
                if let Some(msg) = entries.ring.pop_front() {
                    return Ok(msg);
                }
                if entries.closed {
                    return Err(RpmsgError::QueueClosed);
                }
            }
            // single consumer: a push between the check and this point leaves a permit behind
            self.available.notified().await;
        }
    }

    /// Pop a message, copy its payload to `out` and release its rx buffer. Returns the
    ///  message's source address and length.
    ///
    /// A message that does not fit into `out` is released all the same, and the call fails with
    ///  [RpmsgError::BufferTooSmall].
    pub async fn recv(&self, out: &mut [u8], timeout: Option<Duration>) -> Result<(u32, usize), RpmsgError> {
        let msg = self.pop(timeout).await?;

        let result = if msg.len > out.len() {
            Err(RpmsgError::BufferTooSmall { src: msg.src, len: msg.len, capacity: out.len() })
        }
        else {
            let len = self.transport.read_rx_buffer(msg.buffer, &mut out[..msg.len]);
            Ok((msg.src, len))
        };

        self.release(msg);
        result
    }

    /// Pop a message without copying its payload; read it with [RendezvousQueue::read] and
    ///  hand it back with [RendezvousQueue::release]
    pub async fn recv_nocopy(&self, timeout: Option<Duration>) -> Result<RxMessage, RpmsgError> {
        self.pop(timeout).await
    }

    pub fn read(&self, msg: &RxMessage, out: &mut [u8]) -> usize {
        self.transport.read_rx_buffer(msg.buffer, out)
    }

    pub fn release(&self, msg: RxMessage) {
        trace!("releasing rx buffer {:?}", msg.buffer);
        self.transport.release_rx_buffer(msg.buffer);
    }

    /// Close the queue, releasing the rx buffers of all messages that are still queued. A
    ///  consumer waiting in `pop` is woken up with [RpmsgError::QueueClosed].
    pub fn destroy(&self) {
        let remaining = {
            let mut entries = self.lock();
            entries.closed = true;
            entries.ring.drain(..).collect::<Vec<_>>()
        };

        if !remaining.is_empty() {
            debug!("destroying rendezvous queue with {} unconsumed messages", remaining.len());
        }
        for msg in remaining {
            self.release(msg);
        }
        self.available.notify_one();
    }

    fn lock(&self) -> MutexGuard<'_, QueueEntries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RxHandler for RendezvousQueue {
    fn on_receive(&self, payload: &[u8], msg: RxMessage) -> RxDisposition {
        trace!(src = msg.src, len = msg.len, "received {:?}", String::from_utf8_lossy(payload));

        match self.push(msg) {
            Ok(()) => RxDisposition::Hold,
            Err(RpmsgError::QueueFull) => {
                debug!("rendezvous queue is full, asking for redelivery of the message from {}", msg.src);
                RxDisposition::Retry
            }
            Err(e) => {
                warn!("discarding message from {}: {}", msg.src, e);
                RxDisposition::Release
            }
        }
    }
}
