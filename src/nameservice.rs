//! The nameservice lets a peer discover a named channel without knowing its address up front.
//!
//! The announcing side sends a single message to the peer's well-known nameservice address
//!  ([NS_EPT_ADDR]); the receiving side has a nameservice endpoint bound there
//!  ([bind]), keeps track of announced names and notifies a listener.
//!
//! An announcement has this format:
//!
//! ```ascii
//! 0:  channel name, NUL padded (32 bytes)
//! 32: address of the announced endpoint (u32 LE)
//! 36: flags (u32 LE): 0 = endpoint created, 1 = endpoint destroyed
//! ```

use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::error::RpmsgError;
use crate::transport::{RxDisposition, RxHandler, RxMessage, SendMode, Transport};
use crate::util::fixed_buf::FixedBuf;

/// The well-known address of the nameservice endpoint on either side of a channel
pub const NS_EPT_ADDR: u32 = 53;

/// Size of the name field in an announcement. A name must leave room for a terminating NUL.
pub const NS_NAME_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum NsFlags {
    Create = 0,
    Destroy = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsMessage {
    pub name: String,
    pub addr: u32,
    pub flags: NsFlags,
}

impl NsMessage {
    pub const SERIALIZED_LEN: usize = NS_NAME_SIZE + 2 * std::mem::size_of::<u32>();

    pub fn check_name(name: &str) -> Result<(), RpmsgError> {
        if name.is_empty() {
            return Err(RpmsgError::InvalidNsMessage("empty channel name".to_string()));
        }
        if name.len() >= NS_NAME_SIZE {
            return Err(RpmsgError::InvalidNsMessage(format!("channel name {:?} exceeds {} bytes", name, NS_NAME_SIZE - 1)));
        }
        if name.as_bytes().contains(&0) {
            return Err(RpmsgError::InvalidNsMessage(format!("channel name {:?} contains a NUL byte", name)));
        }
        Ok(())
    }

    pub fn ser(&self, buf: &mut impl BufMut) -> Result<(), RpmsgError> {
        Self::check_name(&self.name)?;

        buf.put_slice(self.name.as_bytes());
        buf.put_bytes(0, NS_NAME_SIZE - self.name.len());
        buf.put_u32_le(self.addr);
        buf.put_u32_le(self.flags.into());
        Ok(())
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<NsMessage, RpmsgError> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(RpmsgError::InvalidNsMessage(format!("announcement has {} bytes, expected {}", buf.remaining(), Self::SERIALIZED_LEN)));
        }

        let mut raw_name = [0u8; NS_NAME_SIZE];
        buf.copy_to_slice(&mut raw_name);
        let name_len = raw_name.iter()
            .position(|&b| b == 0)
            .unwrap_or(NS_NAME_SIZE);
        let name = std::str::from_utf8(&raw_name[..name_len])
            .map_err(|_| RpmsgError::InvalidNsMessage("channel name is not valid UTF-8".to_string()))?
            .to_string();

        let addr = buf.get_u32_le();
        let raw_flags = buf.get_u32_le();
        let flags = NsFlags::try_from(raw_flags)
            .map_err(|_| RpmsgError::InvalidNsMessage(format!("invalid flags {}", raw_flags)))?;

        Ok(NsMessage { name, addr, flags })
    }
}

/// Tell the peer that `name` is served by `endpoint`. This is fire-and-forget: there is no
///  acknowledgement, and nothing happens if the peer has no nameservice bound.
pub async fn announce(endpoint: &Endpoint, name: &str, flags: NsFlags) -> anyhow::Result<()> {
    let msg = NsMessage {
        name: name.to_string(),
        addr: endpoint.addr(),
        flags,
    };
    let mut buf = FixedBuf::new(NsMessage::SERIALIZED_LEN);
    msg.ser(&mut buf)?;

    endpoint.send(NS_EPT_ADDR, buf.as_ref(), SendMode::Blocking).await
        .map_err(|e| RpmsgError::send_failure(NS_EPT_ADDR, e))?;
    info!("nameservice announcement sent: {:?} at address {} ({:?})", name, endpoint.addr(), flags);
    Ok(())
}

/// Called by a nameservice binding when the peer's announcements change what is known about a
///  channel. It runs in the transport's delivery context and must not block.
pub trait NsListener: Send + Sync + 'static {
    fn on_new_endpoint(&self, addr: u32, name: &str, flags: NsFlags);
}

impl<F: Fn(u32, &str, NsFlags) + Send + Sync + 'static> NsListener for F {
    fn on_new_endpoint(&self, addr: u32, name: &str, flags: NsFlags) {
        self(addr, name, flags)
    }
}

/// A listener that does nothing, for a side that does not need to learn addresses through the
///  nameservice
pub struct NoopNsListener;
impl NsListener for NoopNsListener {
    fn on_new_endpoint(&self, _addr: u32, _name: &str, _flags: NsFlags) {}
}

/// Register the local nameservice endpoint. It stays registered until the returned binding is
///  unbound (or dropped).
pub fn bind(transport: Arc<dyn Transport>, listener: Arc<dyn NsListener>) -> Result<NsBinding, RpmsgError> {
    let (changes, _) = watch::channel(0u64);
    let handler = Arc::new(NsEndpointHandler {
        listener,
        registry: Default::default(),
        changes,
    });

    let endpoint = Endpoint::create(transport, NS_EPT_ADDR, handler.clone())?;
    debug!("nameservice bound");

    Ok(NsBinding {
        handler,
        endpoint: Some(endpoint),
    })
}

pub struct NsBinding {
    handler: Arc<NsEndpointHandler>,
    endpoint: Option<Endpoint>,
}

impl Debug for NsBinding {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "NsBinding{{channels:{:?}}}", self.handler.lock_registry())
    }
}

impl NsBinding {
    /// the address most recently announced for a channel name, if it is currently announced
    pub fn resolve(&self, name: &str) -> Option<u32> {
        self.handler.lock_registry().get(name).cloned()
    }

    pub fn num_channels(&self) -> usize {
        self.handler.lock_registry().len()
    }

    /// wait until the peer announced a channel name, returning its address
    pub async fn wait_for(&self, name: &str, timeout: Duration) -> Result<u32, RpmsgError> {
        let mut changes = self.handler.changes.subscribe();
        let wait = async {
            loop {
                if let Some(addr) = self.resolve(name) {
                    return Ok(addr);
                }
                if changes.changed().await.is_err() {
                    return Err(RpmsgError::QueueClosed);
                }
            }
        };
        tokio::time::timeout(timeout, wait).await
            .map_err(|_| RpmsgError::TimedOut)?
    }

    pub fn unbind(mut self) {
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.destroy();
            debug!("nameservice unbound");
        }
    }
}

impl Drop for NsBinding {
    fn drop(&mut self) {
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.destroy();
        }
    }
}

struct NsEndpointHandler {
    listener: Arc<dyn NsListener>,
    registry: Mutex<FxHashMap<String, u32>>,
    changes: watch::Sender<u64>,
}

impl NsEndpointHandler {
    fn lock_registry(&self) -> MutexGuard<'_, FxHashMap<String, u32>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// returns `true` if the announcement changed the registry. Replayed announcements do not.
    fn apply(&self, msg: &NsMessage) -> bool {
        let mut registry = self.lock_registry();
        match msg.flags {
            NsFlags::Create => registry.insert(msg.name.clone(), msg.addr) != Some(msg.addr),
            NsFlags::Destroy => {
                if registry.get(&msg.name) == Some(&msg.addr) {
                    registry.remove(&msg.name);
                    true
                }
                else {
                    false
                }
            }
        }
    }
}

impl RxHandler for NsEndpointHandler {
    fn on_receive(&self, mut payload: &[u8], msg: RxMessage) -> RxDisposition {
        match NsMessage::try_deser(&mut payload) {
            Ok(ns_msg) => {
                if self.apply(&ns_msg) {
                    info!("peer announced channel {:?} at address {} ({:?})", ns_msg.name, ns_msg.addr, ns_msg.flags);
                    self.listener.on_new_endpoint(ns_msg.addr, &ns_msg.name, ns_msg.flags);
                    self.changes.send_modify(|n| *n += 1);
                }
                else {
                    debug!("ignoring repeated announcement of {:?} at address {}", ns_msg.name, ns_msg.addr);
                }
            }
            Err(e) => {
                warn!("discarding nameservice message from {}: {}", msg.src, e);
            }
        }
        RxDisposition::Release
    }
}
