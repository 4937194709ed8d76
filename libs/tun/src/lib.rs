//! The TUN character device: raw IP packets in and out of the kernel.

#[cfg(target_family = "unix")]
mod unix;

#[cfg(target_family = "unix")]
pub use unix::TunDevice;

/// Largest IP packet we ever read from or write to the device.
pub const MAX_PACKET: usize = 1500 + 64;
