use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The states of a session, in the order it goes through them. A session that fails skips
///  ahead to [SessionState::TearingDown].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SessionState {
    Initializing,
    LinkUp,
    Announcing,
    AwaitingHandshake,
    Exchanging,
    TearingDown,
    Terminated,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SessionReport {
    /// the address the handshake came from, if the session got that far
    pub peer_addr: Option<u32>,
    /// number of messages received and echoed
    pub round_trips: u32,
}
