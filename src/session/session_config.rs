use std::time::Duration;

use anyhow::bail;

use crate::nameservice::{NsMessage, NS_EPT_ADDR};

/// address of the session's endpoint
pub const LOCAL_EPT_ADDR: u32 = 30;
/// the channel name the session announces to the peer
pub const NS_ANNOUNCE_NAME: &str = "rpmsg-openamp-demo-channel";
pub const MAX_MESSAGE_SIZE: usize = 100;
/// The handshake's content is not checked, so the buffer only needs to be large enough for the
///  peer's greeting
pub const HANDSHAKE_MESSAGE_SIZE: usize = 13;
/// The session echoes `MAX_EXCHANGES + 1` messages before it tears down
pub const MAX_EXCHANGES: u32 = 100;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub local_addr: u32,
    pub channel_name: String,

    /// receive buffer size during the exchange; a larger message fails the session
    pub max_message_size: usize,
    pub handshake_buffer_size: usize,
    pub max_exchanges: u32,

    pub link_up_timeout: Duration,
    /// delay between binding the nameservice and announcing the channel, giving the peer time
    ///  to set up its side
    pub announce_delay: Duration,
    /// number of messages that can be queued between the transport's delivery context and the
    ///  session before back-pressure kicks in
    pub queue_capacity: usize,
    /// bound for every receive and send during handshake and exchange. `None` waits forever.
    pub exchange_timeout: Option<Duration>,
}

impl SessionConfig {
    pub fn new() -> SessionConfig {
        SessionConfig {
            local_addr: LOCAL_EPT_ADDR,
            channel_name: NS_ANNOUNCE_NAME.to_string(),
            max_message_size: MAX_MESSAGE_SIZE,
            handshake_buffer_size: HANDSHAKE_MESSAGE_SIZE,
            max_exchanges: MAX_EXCHANGES,
            link_up_timeout: Duration::from_secs(600),
            announce_delay: Duration::from_secs(1),
            queue_capacity: 16,
            exchange_timeout: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.local_addr == NS_EPT_ADDR {
            bail!("local address {} is reserved for the nameservice", NS_EPT_ADDR);
        }
        NsMessage::check_name(&self.channel_name)?;
        if self.max_message_size == 0 {
            bail!("max message size must be positive");
        }
        if self.handshake_buffer_size == 0 {
            bail!("handshake buffer size must be positive");
        }
        if self.max_exchanges == u32::MAX {
            bail!("max exchanges must be below {}", u32::MAX);
        }
        if self.queue_capacity == 0 {
            bail!("queue capacity must be positive");
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}
