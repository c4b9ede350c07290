//! A ping-pong session between the two cores of an asymmetric multiprocessing system,
//!  communicating through endpoint-addressed messages over shared memory.
//!
//! The session runs on the remote core. It waits for the link, binds an endpoint and announces
//!  it to the host through the nameservice, takes the host's address from the first message it
//!  receives (the 'handshake'), and then echoes the host's messages until it reached its
//!  exchange limit. After that (or after a failure) it tears everything down again.
//!
//! ```ascii
//! host                                   remote
//!   |                                      | wait for link up
//!   |  <--  ns announcement (to 53)  ---   | bind endpoint 30, announce
//!   |  ---  handshake  ----------------->  | peer address := source of handshake
//!   |  ---  ping-0  -------------------->  |
//!   |  <--  ping-0  ---------------------  |
//!   |  ...                                 |
//!   |  ---  ping-100  ------------------>  |
//!   |  <--  ping-100  -------------------  | tear down
//! ```
//!
//! The transport moving the bytes is abstracted as [transport::Transport];
//!  [transport::mem_channel] connects both sides in-process.
//!
//! Inbound messages are handed from the transport's delivery context to the session worker
//!  through a bounded [rendezvous_queue::RendezvousQueue]. When the queue is full, the transport
//!  holds on to the message and delivers it again later, so nothing is lost or reordered.

pub mod endpoint;
pub mod error;
pub mod nameservice;
pub mod rendezvous_queue;
pub mod session;
pub mod test_util;
pub mod transport;
pub mod util;
