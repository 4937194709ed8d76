//! Platform implementations of [`warp_tunnel::HostAdapter`].
//!
//! macOS drives the classic BSD tools (`ifconfig`, `route`) and the
//! `/etc/resolver` convention; Linux talks rtnetlink and `resolvectl`.

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub use macos::MacosHost as PlatformHost;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::LinuxHost as PlatformHost;
