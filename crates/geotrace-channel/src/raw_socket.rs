//! Raw ICMP socket channel for Unix hosts.
//!
//! Uses a nonblocking `SOCK_RAW`/`IPPROTO_ICMP` socket: the kernel builds
//! the IP header on send (TTL via `IP_TTL`) and delivers received frames
//! starting at the IP layer. Requires CAP_NET_RAW or root.

use crate::reply::{classify_reply, ProbeReply};
use crate::{packet::create_echo_request, ProbeChannel};
use async_trait::async_trait;
use geotrace_core::TraceError;
use std::io::Read;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

/// Global echo id counter for unique ids across channel instances.
static ECHO_ID_COUNTER: AtomicU16 = AtomicU16::new(1);

fn next_echo_id() -> u16 {
    ECHO_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Raw-socket [`ProbeChannel`] bound to the default route interface.
pub struct RawIcmpChannel {
    sock: Option<std::fs::File>,
    target: Ipv4Addr,
    echo_id: u16,
    capture_timeout: Duration,
    buffer: Vec<u8>,
}

impl RawIcmpChannel {
    /// Opens a channel towards `target` with the given capture timeout.
    pub fn open(target: Ipv4Addr, capture_timeout: Duration) -> Result<Self, TraceError> {
        let sock = open_raw_icmp_socket()?;
        Ok(Self {
            sock: Some(sock),
            target,
            echo_id: next_echo_id(),
            capture_timeout,
            buffer: vec![0u8; 1500],
        })
    }

    fn fd(&self) -> Result<RawFd, TraceError> {
        self.sock
            .as_ref()
            .map(|f| f.as_raw_fd())
            .ok_or_else(|| TraceError::Internal("Channel used after close".to_string()))
    }
}

fn open_raw_icmp_socket() -> Result<std::fs::File, TraceError> {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_RAW | libc::SOCK_NONBLOCK,
            libc::IPPROTO_ICMP,
        )
    };
    if fd < 0 {
        return Err(TraceError::ChannelOpen(std::io::Error::last_os_error()));
    }
    // File takes ownership of the fd and closes it on drop.
    Ok(unsafe { std::fs::File::from_raw_fd(fd) })
}

#[async_trait]
impl ProbeChannel for RawIcmpChannel {
    fn capture_timeout(&self) -> Duration {
        self.capture_timeout
    }

    async fn reopen(&mut self, capture_timeout: Duration) -> Result<(), TraceError> {
        // The capture session's timeout is fixed at open; recreate the
        // socket to change it.
        self.sock = Some(open_raw_icmp_socket()?);
        self.capture_timeout = capture_timeout;
        Ok(())
    }

    async fn send_echo(&mut self, ttl: u8, seq: u16) -> Result<(), TraceError> {
        let fd = self.fd()?;

        let ttl_val = ttl as libc::c_int;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                libc::IP_TTL,
                &ttl_val as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(TraceError::SendFailed(std::io::Error::last_os_error()));
        }

        let packet = create_echo_request(self.echo_id, seq)?;

        let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        sa.sin_family = libc::AF_INET as libc::sa_family_t;
        sa.sin_addr.s_addr = u32::from_ne_bytes(self.target.octets());

        let rc = unsafe {
            libc::sendto(
                fd,
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
                0,
                &sa as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(TraceError::SendFailed(std::io::Error::last_os_error()));
        }

        trace!(ttl = ttl, seq = seq, echo_id = self.echo_id, "Sent echo request");
        Ok(())
    }

    async fn recv_reply(&mut self) -> Result<Option<ProbeReply>, TraceError> {
        let deadline = Instant::now() + self.capture_timeout;

        loop {
            let file = self.sock.as_ref().ok_or_else(|| {
                TraceError::Internal("Channel used after close".to_string())
            })?;

            let n = match (&*file).read(&mut self.buffer) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    tokio::task::yield_now().await;
                    continue;
                }
                Err(e) => return Err(TraceError::ProbeIo(e)),
            };

            match classify_reply(&self.buffer[..n], self.echo_id, self.target) {
                Some(reply) => return Ok(Some(reply)),
                // Not ours; keep reading until the deadline.
                None => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    continue;
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TraceError> {
        self.sock.take();
        Ok(())
    }
}
