use std::time::Duration;

use thiserror::Error;


/// Errors of the session layer and of the transport operations it consumes.
///
/// Operations at the session level return `anyhow::Result`; the typed variant can be recovered
///  with `downcast_ref::<RpmsgError>()`.
#[derive(Debug, Error)]
pub enum RpmsgError {
    /// The link to the peer core did not come up in time. Fatal, there is no retry at this layer.
    #[error("link did not come up within {0:?}")]
    LinkTimeout(Duration),

    /// Endpoint creation for an address that is already bound on the channel.
    #[error("address {0} is already bound on this channel")]
    AddressInUse(u32),

    /// A rendezvous queue is at capacity. This is absorbed as back-pressure between the endpoint
    ///  callback and the transport and never reaches the session worker.
    #[error("rendezvous queue is full")]
    QueueFull,

    /// The transport failed to send. The cause is usually another `RpmsgError` and can be
    ///  recovered by downcasting the error's source.
    #[error("sending to address {dst} failed: {cause}")]
    SendFailure {
        dst: u32,
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("timed out")]
    TimedOut,

    #[error("rendezvous queue was destroyed")]
    QueueClosed,

    #[error("message from address {src} has {len} bytes, but the receive buffer holds only {capacity}")]
    BufferTooSmall { src: u32, len: usize, capacity: usize },

    #[error("payload of {len} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("link is down")]
    LinkDown,

    #[error("no free transmit buffer")]
    NoTxBuffer,

    #[error("invalid nameservice message: {0}")]
    InvalidNsMessage(String),
}

impl RpmsgError {
    pub fn send_failure(dst: u32, cause: RpmsgError) -> RpmsgError {
        RpmsgError::SendFailure { dst, cause: Box::new(cause) }
    }
}
