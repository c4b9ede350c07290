use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tracing::{debug, info};

use crate::endpoint::Endpoint;
use crate::nameservice;
use crate::nameservice::{NsBinding, NsFlags, NsListener};
use crate::rendezvous_queue::RendezvousQueue;
use crate::transport::{SendMode, Transport};
use crate::util::fixed_buf::FixedBuf;

pub const HOST_EPT_ADDR: u32 = 40;
pub const HANDSHAKE_PAYLOAD: &[u8] = b"ready\0";

/// large enough for anything the remote side can echo
const HOST_RX_BUFFER_SIZE: usize = 512;
const HOST_QUEUE_CAPACITY: usize = 16;

/// The host side of a ping-pong session, driven step by step by test code: it learns the
///  remote's address from the nameservice, sends the handshake and then pings, and receives the
///  echoes.
pub struct HostPeer {
    ns_binding: Option<NsBinding>,
    queue: Arc<RendezvousQueue>,
    endpoint: Option<Endpoint>,
    remote_addr: Option<u32>,
}

impl HostPeer {
    pub fn new(transport: Arc<dyn Transport>, addr: u32) -> anyhow::Result<HostPeer> {
        Self::with_listener(transport, addr, Arc::new(|addr: u32, name: &str, flags: NsFlags| {
            debug!("host: nameservice reports {:?} at {} ({:?})", name, addr, flags);
        }))
    }

    pub fn with_listener(transport: Arc<dyn Transport>, addr: u32, listener: Arc<dyn NsListener>) -> anyhow::Result<HostPeer> {
        let ns_binding = nameservice::bind(transport.clone(), listener)?;
        let queue = RendezvousQueue::create(transport.clone(), HOST_QUEUE_CAPACITY);
        let endpoint = Endpoint::create(transport, addr, queue.clone())?;

        Ok(HostPeer {
            ns_binding: Some(ns_binding),
            queue,
            endpoint: Some(endpoint),
            remote_addr: None,
        })
    }

    pub fn queue(&self) -> &Arc<RendezvousQueue> {
        &self.queue
    }

    pub fn remote_addr(&self) -> Option<u32> {
        self.remote_addr
    }

    /// Wait for the remote to announce a channel, and use its address for all subsequent sends
    pub async fn resolve_channel(&mut self, name: &str, timeout: Duration) -> anyhow::Result<u32> {
        let ns_binding = self.ns_binding.as_ref()
            .ok_or_else(|| anyhow!("host peer is shut down"))?;

        let remote_addr = ns_binding.wait_for(name, timeout).await?;
        info!("host: channel {:?} resolved to address {}", name, remote_addr);
        self.remote_addr = Some(remote_addr);
        Ok(remote_addr)
    }

    pub async fn send_handshake(&self) -> anyhow::Result<()> {
        self.send(HANDSHAKE_PAYLOAD).await
    }

    pub async fn send(&self, payload: &[u8]) -> anyhow::Result<()> {
        let endpoint = self.endpoint.as_ref()
            .ok_or_else(|| anyhow!("host peer is shut down"))?;
        let remote_addr = self.remote_addr
            .ok_or_else(|| anyhow!("remote address is not resolved yet"))?;

        endpoint.send(remote_addr, payload, SendMode::Blocking).await?;
        Ok(())
    }

    /// receive the next message, returning its source address and payload
    pub async fn recv(&self, timeout: Duration) -> anyhow::Result<(u32, Vec<u8>)> {
        let mut buf = FixedBuf::new(HOST_RX_BUFFER_SIZE);
        buf.maximize_len();

        let (src, len) = self.queue.recv(buf.as_mut(), Some(timeout)).await?;
        buf.truncate(len);
        Ok((src, buf.as_ref().to_vec()))
    }

    /// send a message and wait for the remote's reply to it
    pub async fn ping(&self, payload: &[u8], timeout: Duration) -> anyhow::Result<Vec<u8>> {
        self.send(payload).await?;
        let (src, echo) = self.recv(timeout).await?;
        if Some(src) != self.remote_addr {
            return Err(anyhow!("reply came from {} rather than the remote at {:?}", src, self.remote_addr));
        }
        Ok(echo)
    }

    pub fn shut_down(mut self) {
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.destroy();
        }
        self.queue.destroy();
        if let Some(ns_binding) = self.ns_binding.take() {
            ns_binding.unbind();
        }
    }
}

impl Drop for HostPeer {
    fn drop(&mut self) {
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.destroy();
        }
        self.queue.destroy();
    }
}
