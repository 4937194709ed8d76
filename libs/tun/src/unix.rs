use std::io;
use std::os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd, RawFd};

use anyhow::{Context as _, Result, bail};
use tokio::io::unix::AsyncFd;

use crate::MAX_PACKET;

/// An opened TUN device.
///
/// Reads and writes whole IP packets. The fd is nonblocking and driven
/// through [`AsyncFd`], so `recv` and `send` can be used concurrently from a
/// read pump and a write pump.
pub struct TunDevice {
    fd: AsyncFd<OwnedFd>,
    name: String,
}

impl TunDevice {
    pub fn open(name: &str) -> Result<Self> {
        let fd = platform::open(name).with_context(|| format!("Failed to open TUN device `{name}`"))?;

        set_nonblocking(fd.as_raw_fd()).context("Failed to set TUN fd as non-blocking")?;

        Ok(Self {
            fd: AsyncFd::new(fd).context("Failed to register TUN fd with the runtime")?,
            name: name.to_owned(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receive a single IP packet from the device.
    pub async fn recv(&self) -> io::Result<Vec<u8>> {
        let mut buf = [0u8; MAX_PACKET + platform::PREFIX];

        loop {
            let mut guard = self.fd.readable().await?;

            match guard.try_io(|inner| read(inner.get_ref().as_raw_fd(), &mut buf)) {
                Ok(res) => {
                    let n = res?;

                    if n <= platform::PREFIX {
                        continue; // Truncated frame, nothing to hand out.
                    }

                    return Ok(buf[platform::PREFIX..n].to_vec());
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Send a single IP packet to the device.
    pub async fn send(&self, packet: &[u8]) -> io::Result<()> {
        let frame = platform::frame(packet);

        loop {
            let mut guard = self.fd.writable().await?;

            match guard.try_io(|inner| write(inner.get_ref().as_raw_fd(), &frame)) {
                Ok(res) => {
                    res?;

                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }
}

fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: The fd is owned by us and `buf` outlives the call.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as _, buf.len()) };

    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(n as usize)
}

fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    // SAFETY: The fd is owned by us and `buf` outlives the call.
    let n = unsafe { libc::write(fd, buf.as_ptr() as _, buf.len()) };

    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(n as usize)
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on an owned fd.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }

        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

#[cfg(target_os = "macos")]
mod platform {
    use super::*;
    use std::mem;

    /// utun frames carry a 4-byte protocol family header.
    pub const PREFIX: usize = 4;

    const UTUN_CONTROL_NAME: &[u8] = b"com.apple.net.utun_control";

    pub fn open(name: &str) -> Result<OwnedFd> {
        let index: u32 = name
            .strip_prefix("utun")
            .and_then(|idx| idx.parse().ok())
            .with_context(|| format!("`{name}` is not a valid utun device name"))?;

        // SAFETY: Plain control-socket setup; every return value is checked.
        unsafe {
            let fd = libc::socket(libc::PF_SYSTEM, libc::SOCK_DGRAM, libc::SYSPROTO_CONTROL);
            if fd < 0 {
                bail!("socket(PF_SYSTEM): {}", io::Error::last_os_error());
            }

            let fd = OwnedFd::from_raw_fd(fd);

            let mut info: libc::ctl_info = mem::zeroed();
            for (dst, src) in info.ctl_name.iter_mut().zip(UTUN_CONTROL_NAME) {
                *dst = *src as libc::c_char;
            }

            if libc::ioctl(fd.as_raw_fd(), libc::CTLIOCGINFO, &mut info) < 0 {
                bail!("ioctl(CTLIOCGINFO): {}", io::Error::last_os_error());
            }

            let addr = libc::sockaddr_ctl {
                sc_len: mem::size_of::<libc::sockaddr_ctl>() as u8,
                sc_family: libc::AF_SYSTEM as u8,
                ss_sysaddr: libc::AF_SYS_CONTROL as u16,
                sc_id: info.ctl_id,
                sc_unit: index + 1,
                sc_reserved: [0; 5],
            };

            if libc::connect(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_ctl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ctl>() as libc::socklen_t,
            ) < 0
            {
                bail!("connect(utun {index}): {}", io::Error::last_os_error());
            }

            Ok(fd)
        }
    }

    pub fn frame(packet: &[u8]) -> Vec<u8> {
        let family = match packet.first().map(|b| b >> 4) {
            Some(6) => libc::AF_INET6 as u32,
            _ => libc::AF_INET as u32,
        };

        let mut frame = Vec::with_capacity(PREFIX + packet.len());
        frame.extend_from_slice(&family.to_be_bytes());
        frame.extend_from_slice(packet);

        frame
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use super::*;
    use std::mem;

    /// IFF_NO_PI strips the packet-info header, frames are bare IP packets.
    pub const PREFIX: usize = 0;

    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
    const TUN_FILE: &std::ffi::CStr = c"/dev/net/tun";

    pub fn open(name: &str) -> Result<OwnedFd> {
        if name.len() >= libc::IFNAMSIZ {
            bail!("`{name}` exceeds IFNAMSIZ");
        }

        // SAFETY: open + ioctl with a properly initialised ifreq.
        unsafe {
            let fd = libc::open(TUN_FILE.as_ptr(), libc::O_RDWR);
            if fd < 0 {
                bail!("open(/dev/net/tun): {}", io::Error::last_os_error());
            }

            let fd = OwnedFd::from_raw_fd(fd);

            let mut ifr: libc::ifreq = mem::zeroed();
            for (dst, src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
                *dst = *src as libc::c_char;
            }
            ifr.ifr_ifru.ifru_flags = (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short;

            if libc::ioctl(fd.as_raw_fd(), TUNSETIFF, &ifr) < 0 {
                bail!("ioctl(TUNSETIFF): {}", io::Error::last_os_error());
            }

            Ok(fd)
        }
    }

    pub fn frame(packet: &[u8]) -> Vec<u8> {
        packet.to_vec()
    }
}
