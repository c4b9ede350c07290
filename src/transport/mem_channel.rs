use std::collections::hash_map::Entry;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::error::RpmsgError;
use crate::transport::rx_arena::RxArena;
use crate::transport::{LinkState, RxBufferId, RxDisposition, RxHandler, RxMessage, SendMode, Transport};

pub struct MemChannelConfig {
    /// maximum payload per message, i.e. the size of each rx buffer
    pub buffer_size: usize,
    /// number of rx buffers per direction
    pub buffer_count: usize,
    /// How long a message rejected with [RxDisposition::Retry] waits before it is offered again
    ///  if no buffer was released in the meantime
    pub redelivery_interval: Duration,
}

impl MemChannelConfig {
    pub fn new() -> MemChannelConfig {
        MemChannelConfig {
            buffer_size: 496,
            buffer_count: 16,
            redelivery_interval: Duration::from_millis(1),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.buffer_size == 0 {
            bail!("buffer size must be positive");
        }
        if self.buffer_count == 0 {
            bail!("there must be at least one rx buffer per direction");
        }
        Ok(())
    }
}

impl Default for MemChannelConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a channel with two connected sides, returned as `(remote, host)`. Each side's
///  message delivery runs in a task of its own, so this must be called inside a tokio runtime.
///
/// The link starts out down; either side can bring it up with [MemTransport::set_link_up].
pub fn mem_channel(config: MemChannelConfig) -> anyhow::Result<(Arc<MemTransport>, Arc<MemTransport>)> {
    config.validate()?;
    let config = Arc::new(config);
    let (link, _) = watch::channel(false);
    let link = Arc::new(link);

    let remote = ChannelSide::spawn("remote", config.clone());
    let host = ChannelSide::spawn("host", config.clone());

    Ok((
        Arc::new(MemTransport { config: config.clone(), link: link.clone(), local: remote.clone(), peer: host.clone() }),
        Arc::new(MemTransport { config, link, local: host, peer: remote }),
    ))
}

#[derive(Clone, Copy)]
struct PendingDelivery {
    src: u32,
    dst: u32,
    buffer: RxBufferId,
    len: usize,
}

struct Deliveries {
    pending: VecDeque<PendingDelivery>,
    closed: bool,
}

/// The receiving half of one side of the channel: its endpoints, its rx buffers, and the task
///  delivering inbound messages to the endpoints' callbacks.
///
/// A delivery stays at the head of `pending` until its endpoint accepted it, so closing the side
///  can release every buffer that was sent but not handed over.
struct ChannelSide {
    name: &'static str,
    endpoints: Mutex<FxHashMap<u32, Arc<dyn RxHandler>>>,
    arena: RxArena,
    deliveries: Mutex<Deliveries>,
    arrived: Notify,
    redeliver: Notify,
    delivery_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelSide {
    fn spawn(name: &'static str, config: Arc<MemChannelConfig>) -> Arc<ChannelSide> {
        let side = Arc::new(ChannelSide {
            name,
            endpoints: Default::default(),
            arena: RxArena::new(config.buffer_size, config.buffer_count),
            deliveries: Mutex::new(Deliveries {
                pending: VecDeque::new(),
                closed: false,
            }),
            arrived: Notify::new(),
            redeliver: Notify::new(),
            delivery_task: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::delivery_loop(side.clone(), config.redelivery_interval));
        *side.lock_delivery_task() = Some(handle);
        side
    }

    /// Messages are delivered strictly in order: a message that is rejected with
    ///  [RxDisposition::Retry] blocks all subsequent messages until it is accepted.
    async fn delivery_loop(side: Arc<ChannelSide>, redelivery_interval: Duration) {
        loop {
            match side.deliver_head() {
                Delivered::Closed => break,
                Delivered::Idle => side.arrived.notified().await,
                Delivered::Accepted => {}
                Delivered::Rejected(delivery) => {
                    trace!("{}: endpoint {} applied back-pressure, holding rx buffer {} for redelivery", side.name, delivery.dst, delivery.buffer.0);
                    select! {
                        _ = side.redeliver.notified() => {}
                        _ = sleep(redelivery_interval) => {}
                    }
                }
            }
        }
        debug!("{}: delivery loop terminated", side.name);
    }

    fn enqueue(&self, delivery: PendingDelivery) -> Result<(), RpmsgError> {
        {
            let mut deliveries = self.lock_deliveries();
            if deliveries.closed {
                drop(deliveries);
                self.arena.release(delivery.buffer);
                return Err(RpmsgError::LinkDown);
            }
            deliveries.pending.push_back(delivery);
        }
        self.arrived.notify_one();
        Ok(())
    }

    fn deliver_head(&self) -> Delivered {
        let mut deliveries = self.lock_deliveries();
        if deliveries.closed {
            return Delivered::Closed;
        }
        let Some(delivery) = deliveries.pending.front().copied() else {
            return Delivered::Idle;
        };

        if self.dispatch(&delivery) {
            deliveries.pending.pop_front();
            Delivered::Accepted
        }
        else {
            Delivered::Rejected(delivery)
        }
    }

    /// Returns `false` if the message has to be redelivered. The handler is called with the
    ///  endpoint registry locked, so once an endpoint is unregistered its handler is not called
    ///  again.
    fn dispatch(&self, delivery: &PendingDelivery) -> bool {
        let endpoints = self.lock_endpoints();

        let Some(handler) = endpoints.get(&delivery.dst) else {
            warn!("{}: received message from {} for unbound address {} - dropping", self.name, delivery.src, delivery.dst);
            self.arena.release(delivery.buffer);
            return true;
        };

        let msg = RxMessage {
            buffer: delivery.buffer,
            len: delivery.len,
            src: delivery.src,
        };
        match self.arena.with_payload(delivery.buffer, |payload| handler.on_receive(payload, msg)) {
            RxDisposition::Release => {
                self.arena.release(delivery.buffer);
                true
            }
            RxDisposition::Hold => true,
            RxDisposition::Retry => false,
        }
    }

    /// Stop delivering, releasing the buffers of all messages that were not handed over
    fn close(&self) {
        let undelivered = {
            let mut deliveries = self.lock_deliveries();
            deliveries.closed = true;
            deliveries.pending.drain(..).collect::<Vec<_>>()
        };

        if !undelivered.is_empty() {
            debug!("{}: releasing {} undelivered messages", self.name, undelivered.len());
        }
        for delivery in undelivered {
            self.arena.release(delivery.buffer);
        }
        self.arrived.notify_one();

        if let Some(handle) = self.lock_delivery_task().take() {
            handle.abort();
        }
    }

    fn release(&self, buffer: RxBufferId) {
        self.arena.release(buffer);
        self.redeliver.notify_one();
    }

    fn lock_endpoints(&self) -> MutexGuard<'_, FxHashMap<u32, Arc<dyn RxHandler>>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_deliveries(&self) -> MutexGuard<'_, Deliveries> {
        self.deliveries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_delivery_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.delivery_task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Delivered {
    Accepted,
    Rejected(PendingDelivery),
    Idle,
    Closed,
}

/// One side's handle on an in-memory channel. It sends into the peer's rx buffers and
///  receives into its own.
pub struct MemTransport {
    config: Arc<MemChannelConfig>,
    link: Arc<watch::Sender<bool>>,
    local: Arc<ChannelSide>,
    peer: Arc<ChannelSide>,
}

impl MemTransport {
    pub fn set_link_up(&self) {
        info!("{}: link up", self.local.name);
        self.link.send_replace(true);
    }

    pub fn is_link_up(&self) -> bool {
        *self.link.borrow()
    }

    pub fn is_endpoint_registered(&self, addr: u32) -> bool {
        self.local.lock_endpoints().contains_key(&addr)
    }

    /// number of this side's rx buffers that are neither queued nor in flight
    pub fn free_rx_buffers(&self) -> usize {
        self.local.arena.num_free()
    }

    async fn alloc_in_peer(&self, payload: &[u8]) -> Result<RxBufferId, RpmsgError> {
        let mut link = self.link.subscribe();
        select! {
            buffer = self.peer.arena.alloc(payload) => Ok(buffer),
            _ = link.wait_for(|up| !*up) => Err(RpmsgError::LinkDown),
        }
    }
}

#[async_trait]
impl Transport for MemTransport {
    async fn wait_for_link_up(&self, timeout: Duration) -> LinkState {
        let mut link = self.link.subscribe();
        let is_up = matches!(tokio::time::timeout(timeout, link.wait_for(|up| *up)).await, Ok(Ok(_)));
        if is_up {
            LinkState::Ready
        }
        else {
            LinkState::TimedOut
        }
    }

    fn create_endpoint(&self, addr: u32, handler: Arc<dyn RxHandler>) -> Result<(), RpmsgError> {
        match self.local.lock_endpoints().entry(addr) {
            Entry::Occupied(_) => Err(RpmsgError::AddressInUse(addr)),
            Entry::Vacant(e) => {
                debug!("{}: registered endpoint {}", self.local.name, addr);
                e.insert(handler);
                Ok(())
            }
        }
    }

    fn destroy_endpoint(&self, addr: u32) {
        if self.local.lock_endpoints().remove(&addr).is_some() {
            debug!("{}: unregistered endpoint {}", self.local.name, addr);
        }
        else {
            debug!("{}: destroying endpoint {} which is not registered", self.local.name, addr);
        }
    }

    async fn send(&self, src: u32, dst: u32, payload: &[u8], mode: SendMode) -> Result<(), RpmsgError> {
        if !self.is_link_up() {
            return Err(RpmsgError::LinkDown);
        }
        if payload.len() > self.config.buffer_size {
            return Err(RpmsgError::PayloadTooLarge { len: payload.len(), max: self.config.buffer_size });
        }

        let buffer = match mode {
            SendMode::Blocking => self.alloc_in_peer(payload).await?,
            SendMode::NonBlocking => self.peer.arena.try_alloc(payload)
                .ok_or(RpmsgError::NoTxBuffer)?,
        };

        trace!("{}: sending {} bytes from {} to {}", self.local.name, payload.len(), src, dst);
        self.peer.enqueue(PendingDelivery { src, dst, buffer, len: payload.len() })
    }

    fn read_rx_buffer(&self, buffer: RxBufferId, out: &mut [u8]) -> usize {
        self.local.arena.read(buffer, out)
    }

    fn release_rx_buffer(&self, buffer: RxBufferId) {
        self.local.release(buffer);
    }

    fn deinit(&self) {
        info!("{}: deinitializing transport", self.local.name);
        self.link.send_replace(false);
        self.local.lock_endpoints().clear();
        self.local.close();
    }
}

impl Drop for MemTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.local.lock_delivery_task().take() {
            handle.abort();
        }
    }
}
