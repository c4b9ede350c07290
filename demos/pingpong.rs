use std::time::Duration;

use clap::Parser;
use clap_derive::Parser;
use rpmsg_pingpong::session::session::Session;
use rpmsg_pingpong::session::session_config::SessionConfig;
use rpmsg_pingpong::test_util::host_peer::{HostPeer, HOST_EPT_ADDR};
use rpmsg_pingpong::transport::mem_channel::{mem_channel, MemChannelConfig};
use tracing::{info, Level};

#[derive(Parser)]
struct Args {
    /// the remote echoes this many messages plus one
    #[clap(long, default_value_t = 100)]
    exchanges: u32,

    #[clap(long, default_value_t = 16)]
    queue_capacity: usize,

    #[clap(long, default_value_t = 1000)]
    announce_delay_millis: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let (remote, host) = mem_channel(MemChannelConfig::new())?;

    let mut config = SessionConfig::new();
    config.max_exchanges = args.exchanges;
    config.queue_capacity = args.queue_capacity;
    config.announce_delay = Duration::from_millis(args.announce_delay_millis);
    let channel_name = config.channel_name.clone();

    let mut session = Session::new(remote.clone(), config)?;
    let session_handle = tokio::spawn(async move { session.run().await });

    let mut host_peer = HostPeer::new(host.clone(), HOST_EPT_ADDR)?;
    host.set_link_up();

    let timeout = Duration::from_secs(10);
    host_peer.resolve_channel(&channel_name, timeout).await?;
    host_peer.send_handshake().await?;

    for i in 0..=args.exchanges {
        let ping = format!("ping-{}", i);
        let echo = host_peer.ping(ping.as_bytes(), timeout).await?;
        info!("host received {:?}", String::from_utf8_lossy(&echo));
    }

    let report = session_handle.await??;
    info!("session finished: peer address {:?}, {} round trips", report.peer_addr, report.round_trips);

    host_peer.shut_down();
    Ok(())
}
