use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::transport::RxBufferId;
use crate::util::fixed_buf::FixedBuf;

/// The fixed set of receive buffers of one side of a channel. Unlike a regular buffer pool, the
///  number of buffers is fixed: a sender that finds no free buffer has to wait for the
///  receiving side to release one.
///
/// Buffers are referred to by [RxBufferId], which is what gets passed around while a message is
///  in flight or queued. Each slot has its own lock so that a receive callback working on one
///  buffer does not block the release of another.
pub struct RxArena {
    buf_size: usize,
    slots: Vec<Mutex<FixedBuf>>,
    allocation: Mutex<Allocation>,
    released: Notify,
}

struct Allocation {
    free: Vec<u32>,
    in_use: Vec<bool>,
}

impl RxArena {
    pub fn new(buf_size: usize, buffer_count: usize) -> RxArena {
        assert!(buffer_count > 0, "an rx arena needs at least one buffer");
        assert!(buffer_count <= u32::MAX as usize);

        RxArena {
            buf_size,
            slots: (0..buffer_count)
                .map(|_| Mutex::new(FixedBuf::new(buf_size)))
                .collect(),
            allocation: Mutex::new(Allocation {
                // reversed so that buffers are handed out starting with index 0
                free: (0..buffer_count as u32).rev().collect(),
                in_use: vec![false; buffer_count],
            }),
            released: Notify::new(),
        }
    }

    pub fn num_free(&self) -> usize {
        self.lock_allocation().free.len()
    }

    /// Grab a free buffer and copy `payload` into it, or return `None` if all buffers are in use
    pub fn try_alloc(&self, payload: &[u8]) -> Option<RxBufferId> {
        assert!(payload.len() <= self.buf_size, "payload of {} bytes exceeds buffer size {}", payload.len(), self.buf_size);

        let idx = {
            let mut allocation = self.lock_allocation();
            let idx = allocation.free.pop()?;
            allocation.in_use[idx as usize] = true;
            idx
        };

        self.lock_slot(idx).set(payload);
        trace!("allocated rx buffer {}", idx);
        Some(RxBufferId(idx))
    }

    /// Grab a free buffer, waiting for one to be released if necessary
    pub async fn alloc(&self, payload: &[u8]) -> RxBufferId {
        loop {
            if let Some(id) = self.try_alloc(payload) {
                return id;
            }
            debug!("no free rx buffer: waiting for a release");
            self.released.notified().await;
        }
    }

    /// Run `f` on the payload of an allocated buffer
    pub fn with_payload<R>(&self, id: RxBufferId, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.lock_slot(id.0).as_ref())
    }

    pub fn read(&self, id: RxBufferId, out: &mut [u8]) -> usize {
        self.with_payload(id, |payload| {
            let len = payload.len().min(out.len());
            out[..len].copy_from_slice(&payload[..len]);
            len
        })
    }

    pub fn release(&self, id: RxBufferId) {
        {
            let mut allocation = self.lock_allocation();
            match allocation.in_use.get(id.0 as usize) {
                Some(true) => {}
                Some(false) => {
                    warn!("rx buffer {} released twice - ignoring", id.0);
                    return;
                }
                None => {
                    warn!("release of unknown rx buffer {} - ignoring", id.0);
                    return;
                }
            }
            allocation.in_use[id.0 as usize] = false;
            allocation.free.push(id.0);
        }

        self.lock_slot(id.0).clear();
        trace!("released rx buffer {}", id.0);
        self.released.notify_one();
    }

    fn lock_allocation(&self) -> MutexGuard<'_, Allocation> {
        self.allocation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_slot(&self, idx: u32) -> MutexGuard<'_, FixedBuf> {
        self.slots[idx as usize].lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time;
    use super::*;

    #[test]
    fn test_alloc_copies_payload() {
        let arena = RxArena::new(16, 2);

        let id = arena.try_alloc(b"ping-0").unwrap();
        assert_eq!(id, RxBufferId(0));
        assert_eq!(arena.num_free(), 1);

        let mut out = [0u8; 16];
        assert_eq!(arena.read(id, &mut out), 6);
        assert_eq!(&out[..6], b"ping-0");
        assert_eq!(arena.with_payload(id, |p| p.to_vec()), b"ping-0".to_vec());
    }

    #[test]
    fn test_read_into_short_buffer() {
        let arena = RxArena::new(16, 1);
        let id = arena.try_alloc(b"ping-100").unwrap();

        let mut out = [0u8; 4];
        assert_eq!(arena.read(id, &mut out), 4);
        assert_eq!(&out, b"ping");
    }

    #[test]
    fn test_exhaustion_and_release() {
        let arena = RxArena::new(8, 2);

        let a = arena.try_alloc(b"a").unwrap();
        let _b = arena.try_alloc(b"b").unwrap();
        assert!(arena.try_alloc(b"c").is_none());
        assert_eq!(arena.num_free(), 0);

        arena.release(a);
        assert_eq!(arena.num_free(), 1);

        let c = arena.try_alloc(b"c").unwrap();
        assert_eq!(c, a);
        assert_eq!(arena.with_payload(c, |p| p.to_vec()), b"c".to_vec());
    }

    #[test]
    fn test_double_release_is_ignored() {
        let arena = RxArena::new(8, 2);
        let a = arena.try_alloc(b"a").unwrap();

        arena.release(a);
        arena.release(a);
        arena.release(RxBufferId(17));

        assert_eq!(arena.num_free(), 2);
    }

    #[tokio::test]
    async fn test_blocking_alloc_waits_for_release() {
        time::pause();

        let arena = Arc::new(RxArena::new(8, 1));
        let first = arena.try_alloc(b"first").unwrap();

        let handle = {
            let arena = arena.clone();
            tokio::spawn(async move { arena.alloc(b"second").await })
        };

        time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        arena.release(first);
        let second = handle.await.unwrap();
        assert_eq!(arena.with_payload(second, |p| p.to_vec()), b"second".to_vec());
    }
}
