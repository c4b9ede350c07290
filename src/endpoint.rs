use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::RpmsgError;
use crate::transport::{RxHandler, SendMode, Transport};

/// A local address on the channel with a receive callback bound to it.
///
/// An endpoint owns no buffers: inbound messages go to the callback, outbound messages are
///  sent through the transport with the endpoint's address as their source. [Endpoint::destroy]
///  consumes the endpoint, so it cannot be used after it is destroyed.
pub struct Endpoint {
    addr: u32,
    transport: Arc<dyn Transport>,
    destroyed: bool,
}

impl Debug for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Endpoint{{addr:{}}}", self.addr)
    }
}

impl Endpoint {
    pub fn create(transport: Arc<dyn Transport>, addr: u32, on_receive: Arc<dyn RxHandler>) -> Result<Endpoint, RpmsgError> {
        transport.create_endpoint(addr, on_receive)?;
        debug!("created endpoint {}", addr);

        Ok(Endpoint {
            addr,
            transport,
            destroyed: false,
        })
    }

    pub fn addr(&self) -> u32 {
        self.addr
    }

    pub async fn send(&self, to: u32, payload: &[u8], mode: SendMode) -> Result<(), RpmsgError> {
        self.transport.send(self.addr, to, payload, mode).await
    }

    /// Unregister the receive callback. No callback is invoked through this endpoint after this
    ///  returns.
    pub fn destroy(mut self) {
        self.do_destroy();
    }

    fn do_destroy(&mut self) {
        if !self.destroyed {
            self.transport.destroy_endpoint(self.addr);
            self.destroyed = true;
            debug!("destroyed endpoint {}", self.addr);
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if !self.destroyed {
            warn!("endpoint {} dropped without being destroyed", self.addr);
            self.do_destroy();
        }
    }
}
