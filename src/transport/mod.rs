//! The interface of the underlying shared-memory transport. The session layer is written
//!  against [Transport] only: how buffers are laid out in shared memory, how the vrings are
//!  managed and how the peer core is signalled is the transport's business.
//!
//! [mem_channel] is an in-process implementation connecting two sides of a channel through
//!  ordinary memory, for running and testing sessions without a second core.

pub mod mem_channel;
pub mod rx_arena;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::error::RpmsgError;


/// Ticket for a received buffer that lives in transport-owned storage. Whoever holds a ticket
///  after an `RxDisposition::Hold` is responsible for handing it back through
///  [Transport::release_rx_buffer], exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RxBufferId(pub u32);

/// Metadata of a received message, as handed to an endpoint's receive callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxMessage {
    pub buffer: RxBufferId,
    pub len: usize,
    pub src: u32,
}

/// A receive callback's decision about the buffer it was handed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxDisposition {
    /// the message was handled, the transport may reuse the buffer
    Release,
    /// the callback took ownership of the buffer; it will be released through the transport later
    Hold,
    /// the callback cannot take the message right now: the transport keeps the buffer and
    ///  redelivers it later, ahead of any message that arrived after it
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// wait for a free transmit buffer
    Blocking,
    /// fail with [RpmsgError::NoTxBuffer] if there is no free transmit buffer
    NonBlocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Ready,
    TimedOut,
}

/// An endpoint's receive callback.
///
/// This is called in the transport's delivery context, which must not be blocked: an
///  implementation either accepts the message synchronously or asks for redelivery. A callback
///  must not create or destroy endpoints itself.
#[cfg_attr(test, automock)]
pub trait RxHandler: Send + Sync + 'static {
    fn on_receive(&self, payload: &[u8], msg: RxMessage) -> RxDisposition;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn wait_for_link_up(&self, timeout: Duration) -> LinkState;

    /// Register a receive callback for a local address. Fails with [RpmsgError::AddressInUse]
    ///  if the address is bound already.
    fn create_endpoint(&self, addr: u32, handler: Arc<dyn RxHandler>) -> Result<(), RpmsgError>;

    /// Unregister an address. If its callback is running, this waits for it to return; the
    ///  callback is not invoked again afterwards.
    fn destroy_endpoint(&self, addr: u32);

    async fn send(&self, src: u32, dst: u32, payload: &[u8], mode: SendMode) -> Result<(), RpmsgError>;

    /// Copy a held buffer's payload to `out`, returning the number of bytes copied. This is
    ///  the smaller of the payload length and `out.len()`.
    fn read_rx_buffer(&self, buffer: RxBufferId, out: &mut [u8]) -> usize;

    fn release_rx_buffer(&self, buffer: RxBufferId);

    fn deinit(&self);
}
