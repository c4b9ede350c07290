use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use tokio::time::sleep;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::error::RpmsgError;
use crate::nameservice;
use crate::nameservice::{NoopNsListener, NsBinding, NsFlags};
use crate::rendezvous_queue::RendezvousQueue;
use crate::session::session_config::SessionConfig;
use crate::session::session_state::{SessionReport, SessionState};
use crate::transport::{LinkState, SendMode, Transport};
use crate::util::fixed_buf::FixedBuf;

/// Run a session with the default configuration on a transport, returning after the exchange
///  is complete or after a fatal error. Either way, the session is torn down and the transport
///  is deinitialized when this returns.
pub async fn run_session(transport: Arc<dyn Transport>) -> anyhow::Result<SessionReport> {
    Session::new(transport, SessionConfig::new())?
        .run().await
}

/// The remote side of a ping-pong session: it waits for the link, announces its channel,
///  takes the peer's address from the handshake and then echoes the peer's messages back until
///  the configured number of exchanges is reached.
///
/// A session runs exactly once. All resources it creates are owned by the `Session` and released
///  in reverse order when it terminates, whether it completed or failed.
pub struct Session {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    state: SessionState,

    queue: Option<Arc<RendezvousQueue>>,
    endpoint: Option<Endpoint>,
    ns_binding: Option<NsBinding>,

    peer_addr: Option<u32>,
    exchange_count: u32,
    msg: FixedBuf,
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session{{addr:{}, state:{:?}, peer:{:?}, exchanges:{}}}", self.config.local_addr, self.state, self.peer_addr, self.exchange_count)
    }
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> anyhow::Result<Session> {
        config.validate()?;

        let msg = FixedBuf::new(config.max_message_size);
        Ok(Session {
            config,
            transport,
            state: SessionState::Initializing,
            queue: None,
            endpoint: None,
            ns_binding: None,
            peer_addr: None,
            exchange_count: 0,
            msg,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer_addr(&self) -> Option<u32> {
        self.peer_addr
    }

    pub fn exchange_count(&self) -> u32 {
        self.exchange_count
    }

    pub async fn run(&mut self) -> anyhow::Result<SessionReport> {
        if self.state != SessionState::Initializing {
            bail!("session was run before, it is {:?}", self.state);
        }

        let session_id = Uuid::new_v4();
        let span = span!(Level::INFO, "session", ?session_id, local_addr = self.config.local_addr);

        async move {
            let result = self.establish_and_exchange().await;
            if let Err(e) = &result {
                error!("session failed in state {:?}: {:#}", self.state, e);
            }

            let report = SessionReport {
                peer_addr: self.peer_addr,
                round_trips: self.exchange_count,
            };
            self.tear_down();

            result.map(|_| {
                info!("session complete after {} round trips", report.round_trips);
                report
            })
        }
            .instrument(span)
            .await
    }

    async fn establish_and_exchange(&mut self) -> anyhow::Result<()> {
        info!("waiting for link up");
        if self.transport.wait_for_link_up(self.config.link_up_timeout).await == LinkState::TimedOut {
            return Err(RpmsgError::LinkTimeout(self.config.link_up_timeout).into());
        }
        self.set_state(SessionState::LinkUp);

        let queue = RendezvousQueue::create(self.transport.clone(), self.config.queue_capacity);
        self.queue = Some(queue.clone());
        self.endpoint = Some(Endpoint::create(self.transport.clone(), self.config.local_addr, queue.clone())?);
        self.ns_binding = Some(nameservice::bind(self.transport.clone(), Arc::new(NoopNsListener))?);
        self.set_state(SessionState::Announcing);

        sleep(self.config.announce_delay).await;
        if let Some(endpoint) = &self.endpoint {
            nameservice::announce(endpoint, &self.config.channel_name, NsFlags::Create).await?;
        }
        self.set_state(SessionState::AwaitingHandshake);

        let peer_addr = self.await_handshake(&queue).await?;
        self.peer_addr = Some(peer_addr);
        self.set_state(SessionState::Exchanging);

        self.exchange(&queue, peer_addr).await
    }

    /// The handshake's content is not inspected, only its source address matters. A handshake
    ///  that exceeds the buffer is accepted all the same.
    async fn await_handshake(&self, queue: &RendezvousQueue) -> anyhow::Result<u32> {
        let mut handshake = FixedBuf::new(self.config.handshake_buffer_size);
        handshake.maximize_len();

        match queue.recv(handshake.as_mut(), self.config.exchange_timeout).await {
            Ok((src, len)) => {
                handshake.truncate(len);
                info!("received handshake from {}: {:?}", src, String::from_utf8_lossy(handshake.as_ref()));
                Ok(src)
            }
            Err(RpmsgError::BufferTooSmall { src, len, .. }) => {
                warn!("handshake from {} has {} bytes and was truncated - accepting it anyway", src, len);
                Ok(src)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exchange(&mut self, queue: &RendezvousQueue, peer_addr: u32) -> anyhow::Result<()> {
        let Some(endpoint) = &self.endpoint else {
            bail!("no endpoint to exchange messages through");
        };

        while self.exchange_count <= self.config.max_exchanges {
            self.msg.maximize_len();
            let (src, len) = queue.recv(self.msg.as_mut(), self.config.exchange_timeout).await?;
            self.msg.truncate(len);

            if src != peer_addr {
                warn!("ignoring message from {} which is not the peer {}", src, peer_addr);
                continue;
            }
            trace!("message #{} from {}: {:?}", self.exchange_count, src, String::from_utf8_lossy(self.msg.as_ref()));

            self.exchange_count += 1;
            send_bounded(endpoint, peer_addr, self.msg.as_ref(), self.config.exchange_timeout).await?;
        }
        debug!("exchange complete");
        Ok(())
    }

    /// Release everything the session created, in reverse order. This is idempotent and skips
    ///  whatever was not created.
    fn tear_down(&mut self) {
        self.set_state(SessionState::TearingDown);

        if let Some(endpoint) = self.endpoint.take() {
            endpoint.destroy();
        }
        if let Some(queue) = self.queue.take() {
            queue.destroy();
        }
        if let Some(ns_binding) = self.ns_binding.take() {
            ns_binding.unbind();
        }
        self.transport.deinit();

        self.exchange_count = 0;
        self.msg.wipe();
        self.set_state(SessionState::Terminated);
    }

    fn set_state(&mut self, state: SessionState) {
        info!("{:?} -> {:?}", self.state, state);
        self.state = state;
    }
}

/// A blocking send that is optionally bounded in time. Expiry of the bound is reported as
///  [RpmsgError::TimedOut], any other failure as [RpmsgError::SendFailure].
async fn send_bounded(endpoint: &Endpoint, to: u32, payload: &[u8], timeout: Option<Duration>) -> Result<(), RpmsgError> {
    let send = async {
        endpoint.send(to, payload, SendMode::Blocking).await
            .map_err(|e| RpmsgError::send_failure(to, e))
    };

    match timeout {
        None => send.await,
        Some(timeout) => tokio::time::timeout(timeout, send).await
            .map_err(|_| RpmsgError::TimedOut)?,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use mockall::predicate::eq;
    use mockall::Sequence;
    use tokio::time;
    use crate::nameservice::{NsMessage, NS_EPT_ADDR};
    use crate::session::session_config::{LOCAL_EPT_ADDR, NS_ANNOUNCE_NAME};
    use crate::test_util::host_peer::{HostPeer, HOST_EPT_ADDR};
    use crate::transport::mem_channel::{mem_channel, MemChannelConfig, MemTransport};
    use crate::transport::{MockRxHandler, MockTransport, RxBufferId, RxDisposition, RxMessage};
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn config(max_exchanges: u32) -> SessionConfig {
        let mut config = SessionConfig::new();
        config.max_exchanges = max_exchanges;
        config
    }

    /// spawn a session on the remote side and bring up the link, returning a host peer that
    ///  has completed the handshake
    async fn start_session(config: SessionConfig) -> (Arc<MemTransport>, Arc<MemTransport>, HostPeer, tokio::task::JoinHandle<(Session, anyhow::Result<SessionReport>)>) {
        let (remote, host) = mem_channel(MemChannelConfig::new()).unwrap();
        let mut host_peer = HostPeer::new(host.clone(), HOST_EPT_ADDR).unwrap();

        let handle = {
            let mut session = Session::new(remote.clone(), config).unwrap();
            tokio::spawn(async move {
                let result = session.run().await;
                (session, result)
            })
        };
        host.set_link_up();

        assert_eq!(host_peer.resolve_channel(NS_ANNOUNCE_NAME, TIMEOUT).await.unwrap(), LOCAL_EPT_ADDR);
        host_peer.send_handshake().await.unwrap();
        (remote, host, host_peer, handle)
    }

    fn assert_torn_down(remote: &MemTransport, session: &Session) {
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(session.exchange_count(), 0);
        assert!(!remote.is_endpoint_registered(LOCAL_EPT_ADDR));
        assert!(!remote.is_endpoint_registered(NS_EPT_ADDR));
        assert!(!remote.is_link_up());
        assert_eq!(remote.free_rx_buffers(), 16);
    }

    #[tokio::test]
    async fn test_ping_pong() {
        time::pause();
        let (remote, host) = mem_channel(MemChannelConfig::new()).unwrap();
        let mut host_peer = HostPeer::new(host.clone(), HOST_EPT_ADDR).unwrap();

        let handle = tokio::spawn(run_session(remote.clone()));
        host.set_link_up();

        let remote_addr = host_peer.resolve_channel(NS_ANNOUNCE_NAME, TIMEOUT).await.unwrap();
        assert_eq!(remote_addr, 30);
        host_peer.send_handshake().await.unwrap();

        for i in 0..=100 {
            let ping = format!("ping-{}", i);
            let echo = host_peer.ping(ping.as_bytes(), TIMEOUT).await.unwrap();
            assert_eq!(echo, ping.as_bytes());
        }

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report, SessionReport { peer_addr: Some(40), round_trips: 101 });

        assert!(!remote.is_endpoint_registered(30));
        assert!(!remote.is_endpoint_registered(53));
        assert_eq!(remote.free_rx_buffers(), 16);

        let after_teardown = host_peer.ping(b"ping-101", TIMEOUT).await.unwrap_err();
        assert!(matches!(after_teardown.downcast_ref::<RpmsgError>(), Some(RpmsgError::LinkDown)));
    }

    #[tokio::test]
    async fn test_observable_state() {
        time::pause();
        let (remote, host, host_peer, handle) = start_session(config(1)).await;

        assert_eq!(host_peer.ping(b"ping-0", TIMEOUT).await.unwrap(), b"ping-0");
        assert_eq!(host_peer.ping(b"ping-1", TIMEOUT).await.unwrap(), b"ping-1");

        let (session, result) = handle.await.unwrap();
        assert_eq!(result.unwrap(), SessionReport { peer_addr: Some(HOST_EPT_ADDR), round_trips: 2 });
        assert_eq!(session.peer_addr(), Some(HOST_EPT_ADDR));
        assert_torn_down(&remote, &session);
        assert!(!host.is_link_up());
    }

    #[tokio::test]
    async fn test_link_timeout() {
        time::pause();
        let mut transport = MockTransport::new();
        transport.expect_wait_for_link_up()
            .once()
            .return_const(LinkState::TimedOut);
        transport.expect_create_endpoint()
            .never();
        transport.expect_deinit()
            .once()
            .return_const(());

        let mut session = Session::new(Arc::new(transport), SessionConfig::new()).unwrap();
        assert_eq!(session.state(), SessionState::Initializing);

        let err = session.run().await.unwrap_err();
        assert!(matches!(err.downcast_ref::<RpmsgError>(), Some(RpmsgError::LinkTimeout(_))));
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(session.peer_addr(), None);
    }

    #[tokio::test]
    async fn test_link_timeout_through_transport() {
        time::pause();
        let (remote, _host) = mem_channel(MemChannelConfig::new()).unwrap();

        let err = run_session(remote.clone()).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<RpmsgError>(), Some(RpmsgError::LinkTimeout(d)) if *d == Duration::from_secs(600)));
        assert!(!remote.is_endpoint_registered(LOCAL_EPT_ADDR));
    }

    #[tokio::test]
    async fn test_address_in_use() {
        time::pause();
        let (remote, host) = mem_channel(MemChannelConfig::new()).unwrap();
        host.set_link_up();
        remote.create_endpoint(LOCAL_EPT_ADDR, Arc::new(MockRxHandler::new())).unwrap();

        let mut session = Session::new(remote.clone(), SessionConfig::new()).unwrap();
        let err = session.run().await.unwrap_err();

        assert!(matches!(err.downcast_ref::<RpmsgError>(), Some(RpmsgError::AddressInUse(30))));
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(!remote.is_endpoint_registered(NS_EPT_ADDR));
        assert!(!remote.is_link_up());
    }

    #[tokio::test]
    async fn test_send_failure() {
        time::pause();
        let (remote, host, host_peer, handle) = start_session(SessionConfig::new()).await;

        // the link goes down before the session gets to echo the message
        host_peer.send(b"ping-0").await.unwrap();
        host.deinit();

        let (session, result) = handle.await.unwrap();
        let err = result.unwrap_err();
        match err.downcast_ref::<RpmsgError>() {
            Some(RpmsgError::SendFailure { dst, cause }) => {
                assert_eq!(*dst, HOST_EPT_ADDR);
                assert!(matches!(cause.downcast_ref::<RpmsgError>(), Some(RpmsgError::LinkDown)));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_torn_down(&remote, &session);
    }

    #[tokio::test]
    async fn test_exchange_timeout() {
        time::pause();
        let mut config = SessionConfig::new();
        config.exchange_timeout = Some(Duration::from_secs(2));
        let (remote, _host, host_peer, handle) = start_session(config).await;

        assert_eq!(host_peer.ping(b"ping-0", TIMEOUT).await.unwrap(), b"ping-0");

        let (session, result) = handle.await.unwrap();
        assert!(matches!(result.unwrap_err().downcast_ref::<RpmsgError>(), Some(RpmsgError::TimedOut)));
        assert_torn_down(&remote, &session);
    }

    #[tokio::test]
    async fn test_message_from_other_source_is_ignored() {
        time::pause();
        let (remote, host, host_peer, handle) = start_session(config(2)).await;

        assert_eq!(host_peer.ping(b"ping-0", TIMEOUT).await.unwrap(), b"ping-0");
        host.send(HOST_EPT_ADDR + 1, LOCAL_EPT_ADDR, b"stray", SendMode::Blocking).await.unwrap();
        assert_eq!(host_peer.ping(b"ping-1", TIMEOUT).await.unwrap(), b"ping-1");
        assert_eq!(host_peer.ping(b"ping-2", TIMEOUT).await.unwrap(), b"ping-2");

        let (session, result) = handle.await.unwrap();
        assert_eq!(result.unwrap().round_trips, 3);
        assert!(host_peer.queue().is_empty());
        assert_torn_down(&remote, &session);
    }

    #[tokio::test]
    async fn test_oversize_message_is_fatal() {
        time::pause();
        let (remote, _host, host_peer, handle) = start_session(SessionConfig::new()).await;

        host_peer.send(&[b'x'; 101]).await.unwrap();

        let (session, result) = handle.await.unwrap();
        assert!(matches!(result.unwrap_err().downcast_ref::<RpmsgError>(), Some(RpmsgError::BufferTooSmall { src: 40, len: 101, capacity: 100 })));
        assert_torn_down(&remote, &session);
    }

    #[tokio::test]
    async fn test_long_handshake_is_accepted() {
        time::pause();
        let (remote, host) = mem_channel(MemChannelConfig::new()).unwrap();
        let mut host_peer = HostPeer::new(host.clone(), HOST_EPT_ADDR).unwrap();
        let handle = tokio::spawn(run_session(remote.clone()));
        host.set_link_up();

        host_peer.resolve_channel(NS_ANNOUNCE_NAME, TIMEOUT).await.unwrap();
        host_peer.send(b"a rather long handshake").await.unwrap();
        for i in 0..=100 {
            host_peer.ping(format!("ping-{}", i).as_bytes(), TIMEOUT).await.unwrap();
        }

        assert_eq!(handle.await.unwrap().unwrap().peer_addr, Some(HOST_EPT_ADDR));
    }

    #[tokio::test]
    async fn test_replayed_announcement() {
        time::pause();
        let (remote, host) = mem_channel(MemChannelConfig::new()).unwrap();
        let num_announcements = Arc::new(AtomicUsize::new(0));
        let mut host_peer = {
            let num_announcements = num_announcements.clone();
            HostPeer::with_listener(host.clone(), HOST_EPT_ADDR, Arc::new(move |_: u32, _: &str, _: NsFlags| {
                num_announcements.fetch_add(1, Ordering::SeqCst);
            })).unwrap()
        };
        let handle = tokio::spawn(run_session(remote.clone()));
        host.set_link_up();

        host_peer.resolve_channel(NS_ANNOUNCE_NAME, TIMEOUT).await.unwrap();

        let mut replay = FixedBuf::new(NsMessage::SERIALIZED_LEN);
        NsMessage { name: NS_ANNOUNCE_NAME.to_string(), addr: LOCAL_EPT_ADDR, flags: NsFlags::Create }
            .ser(&mut replay).unwrap();
        remote.send(LOCAL_EPT_ADDR, NS_EPT_ADDR, replay.as_ref(), SendMode::Blocking).await.unwrap();

        host_peer.send_handshake().await.unwrap();
        for i in 0..=100 {
            let ping = format!("ping-{}", i);
            assert_eq!(host_peer.ping(ping.as_bytes(), TIMEOUT).await.unwrap(), ping.as_bytes());
        }
        handle.await.unwrap().unwrap();

        assert_eq!(num_announcements.load(Ordering::SeqCst), 1);
        assert!(host_peer.queue().is_empty());
        assert_eq!(host.free_rx_buffers(), 16);
    }

    #[tokio::test]
    async fn test_host_sending_past_the_exchange_bound() {
        time::pause();
        let mut config = config(0);
        config.queue_capacity = 1;
        let (remote, _host, host_peer, handle) = start_session(config).await;

        for i in 0..3 {
            host_peer.send(format!("ping-{}", i).as_bytes()).await.unwrap();
        }

        let (session, result) = handle.await.unwrap();
        assert_eq!(result.unwrap(), SessionReport { peer_addr: Some(HOST_EPT_ADDR), round_trips: 1 });
        assert_eq!(host_peer.recv(TIMEOUT).await.unwrap(), (LOCAL_EPT_ADDR, b"ping-0".to_vec()));
        assert!(host_peer.queue().is_empty());
        assert_torn_down(&remote, &session);
    }

    #[tokio::test]
    async fn test_tear_down_order() {
        time::pause();
        let mut seq = Sequence::new();
        let mut transport = MockTransport::new();
        transport.expect_wait_for_link_up()
            .once()
            .return_const(LinkState::Ready);
        transport.expect_create_endpoint()
            .once()
            .withf(|addr, _| *addr == LOCAL_EPT_ADDR)
            .returning(|_, handler| {
                // a message is waiting in the queue when the session fails
                let msg = RxMessage { buffer: RxBufferId(9), len: 5, src: HOST_EPT_ADDR };
                assert_eq!(handler.on_receive(b"early", msg), RxDisposition::Hold);
                Ok(())
            });
        transport.expect_create_endpoint()
            .once()
            .withf(|addr, _| *addr == NS_EPT_ADDR)
            .returning(|_, _| Ok(()));
        transport.expect_send()
            .once()
            .withf(|src, dst, _, _| *src == LOCAL_EPT_ADDR && *dst == NS_EPT_ADDR)
            .returning(|_, _, _, _| Err(RpmsgError::LinkDown));

        transport.expect_destroy_endpoint()
            .once()
            .with(eq(LOCAL_EPT_ADDR))
            .in_sequence(&mut seq)
            .return_const(());
        transport.expect_release_rx_buffer()
            .once()
            .with(eq(RxBufferId(9)))
            .in_sequence(&mut seq)
            .return_const(());
        transport.expect_destroy_endpoint()
            .once()
            .with(eq(NS_EPT_ADDR))
            .in_sequence(&mut seq)
            .return_const(());
        transport.expect_deinit()
            .once()
            .in_sequence(&mut seq)
            .return_const(());

        let mut session = Session::new(Arc::new(transport), SessionConfig::new()).unwrap();
        let err = session.run().await.unwrap_err();

        assert!(matches!(err.downcast_ref::<RpmsgError>(), Some(RpmsgError::SendFailure { dst: 53, .. })));
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn test_run_twice() {
        time::pause();
        let mut transport = MockTransport::new();
        transport.expect_wait_for_link_up()
            .return_const(LinkState::TimedOut);
        transport.expect_deinit()
            .once()
            .return_const(());

        let mut session = Session::new(Arc::new(transport), SessionConfig::new()).unwrap();
        assert!(session.run().await.is_err());

        let err = session.run().await.unwrap_err();
        assert!(err.downcast_ref::<RpmsgError>().is_none());
    }

    #[test]
    fn test_invalid_config() {
        let mut config = SessionConfig::new();
        config.local_addr = NS_EPT_ADDR;
        assert!(Session::new(Arc::new(MockTransport::new()), config).is_err());
    }
}
