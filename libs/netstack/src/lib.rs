//! A userspace TCP/IP stack over raw IP packets.
//!
//! The stack consumes packets from a transport (a TUN device, a WireGuard
//! peer, or a test harness), materialises TCP connections and UDP sessions as
//! [`TcpFlow`] and [`UdpFlow`] values, and emits the packets that answer them.
//!
//! TCP is driven by [`smoltcp`] behind an any-ip interface; listening sockets
//! are created on demand when a SYN for a new port shows up. UDP is tracked
//! as plain 4-tuple sessions parsed straight off the wire.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod device;
mod flow;
mod stack;

pub use flow::{SessionClosed, TcpFlow, UdpFlow};
pub use stack::{ConnectError, Connector, Stack, StackConfig, StackHandle};
