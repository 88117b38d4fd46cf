//! Frame sources feeding the capture loop.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to open packet socket: {0}")]
    Socket(#[source] io::Error),

    #[error("Failed to bind packet socket to '{interface}': {source}")]
    Bind { interface: String, source: io::Error },

    #[error("Invalid interface name '{0}'")]
    InterfaceName(String),

    #[error("No such interface '{0}'")]
    UnknownInterface(String),

    #[error("Failed to register packet socket with the runtime: {0}")]
    Register(#[source] io::Error),

    #[error("Packet capture is only supported on Linux")]
    Unsupported,
}

#[async_trait]
pub trait PacketSource: Send {
    /// Copies the next frame into `buf`, truncating it to `buf.len()`.
    /// `Ok(None)` means the source is exhausted and will yield nothing more.
    async fn next_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    fn describe(&self) -> String;
}

/// Replays frames from memory. Used by tests and offline runs.
#[derive(Debug, Default)]
pub struct ReplaySource {
    frames: VecDeque<Vec<u8>>,
    hold_open: bool,
}

impl ReplaySource {
    pub fn new(frames: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self { frames: frames.into_iter().collect(), hold_open: false }
    }

    /// After the last frame, wait forever instead of reporting exhaustion,
    /// the way a live interface behaves.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

#[async_trait]
impl PacketSource for ReplaySource {
    async fn next_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.frames.pop_front() {
            Some(frame) => {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                Ok(Some(len))
            }
            None if self.hold_open => std::future::pending().await,
            None => Ok(None),
        }
    }

    fn describe(&self) -> String {
        format!("replay frames={}", self.frames.len())
    }
}

#[cfg(target_os = "linux")]
pub use raw::RawSocketSource;

#[cfg(target_os = "linux")]
mod raw {
    use super::{PacketSource, SourceError};
    use async_trait::async_trait;
    use ipnet::IpNet;
    use log::{info, warn};
    use std::ffi::CString;
    use std::io;
    use std::mem;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use tokio::io::unix::AsyncFd;

    /// `AF_PACKET` datagram socket: frames arrive without the link header,
    /// filtered to one network protocol.
    pub struct RawSocketSource {
        fd: AsyncFd<OwnedFd>,
        interface: String,
        promiscuous: bool,
    }

    impl RawSocketSource {
        /// Opens the socket for the family of `local`. An unknown interface is
        /// an error; failing to enable promiscuous mode is logged, not fatal.
        pub fn open(interface: &str, local: &IpNet) -> Result<Self, SourceError> {
            let protocol = match local {
                IpNet::V4(_) => libc::ETH_P_IP as u16,
                IpNet::V6(_) => libc::ETH_P_IPV6 as u16,
            };
            let name = CString::new(interface).map_err(|_| SourceError::InterfaceName(interface.to_string()))?;

            // An index of 0 would bind the socket to every interface.
            // SAFETY: `name` is a valid NUL terminated string.
            let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
            if index == 0 {
                return Err(SourceError::UnknownInterface(interface.to_string()));
            }

            // SAFETY: plain syscall, the result is checked before use.
            let raw = unsafe {
                libc::socket(libc::AF_PACKET, libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, i32::from(protocol.to_be()))
            };
            if raw < 0 {
                return Err(SourceError::Socket(io::Error::last_os_error()));
            }
            // SAFETY: `raw` is a freshly opened descriptor owned by nobody else.
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };

            // SAFETY: sockaddr_ll is plain data, all-zero is a valid value.
            let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
            addr.sll_family = libc::AF_PACKET as u16;
            addr.sll_protocol = protocol.to_be();
            addr.sll_ifindex = index as i32;
            // SAFETY: `addr` outlives the call and the length matches its type.
            let rc = unsafe {
                libc::bind(
                    fd.as_raw_fd(),
                    &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                return Err(SourceError::Bind { interface: interface.to_string(), source: io::Error::last_os_error() });
            }

            let promiscuous = enable_promiscuous(&fd, index, interface);
            let fd = AsyncFd::new(fd).map_err(SourceError::Register)?;
            info!("capture.event=socket_open interface={} protocol={:#06x} promiscuous={}", interface, protocol, promiscuous);
            Ok(Self { fd, interface: interface.to_string(), promiscuous })
        }

        pub fn is_promiscuous(&self) -> bool {
            self.promiscuous
        }
    }

    fn enable_promiscuous(fd: &OwnedFd, index: u32, interface: &str) -> bool {
        let request = libc::packet_mreq {
            mr_ifindex: index as i32,
            mr_type: libc::PACKET_MR_PROMISC as u16,
            mr_alen: 0,
            mr_address: [0; 8],
        };
        // SAFETY: `request` outlives the call and the length matches its type.
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_PACKET,
                libc::PACKET_ADD_MEMBERSHIP,
                &request as *const libc::packet_mreq as *const libc::c_void,
                mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            warn!("capture.event=promiscuous_failed interface={} error={}", interface, io::Error::last_os_error());
            return false;
        }
        true
    }

    #[async_trait]
    impl PacketSource for RawSocketSource {
        async fn next_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
            loop {
                let mut guard = self.fd.readable().await?;
                let read = guard.try_io(|inner| {
                    // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
                    let n = unsafe { libc::recv(inner.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                });
                match read {
                    Ok(result) => return result.map(Some),
                    Err(_would_block) => continue,
                }
            }
        }

        fn describe(&self) -> String {
            format!("packet interface={}", self.interface)
        }
    }
}
