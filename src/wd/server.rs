use crate::wd::log::event;
use anyhow::Context as _;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::socket::{self, sockopt::ReuseAddr, AddressFamily, SockFlag, SockType, SockaddrIn};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::os::fd::AsRawFd as _;
use std::time::Duration;
use tokio::net::UdpSocket;

/// Bound datagram listener used as the supervisor's tick gate.
pub struct UdpEndpoint {
    sock: UdpSocket,
    port: u16,
}

impl UdpEndpoint {
    /// Binds 0.0.0.0:port with address reuse. Also flips SIGCHLD/SIGPIPE to
    /// ignore: auto-reaped children keep the zero-signal probe accurate, and
    /// writes to dead peers must not kill the supervisor.
    pub fn bind(port: u16) -> anyhow::Result<Self> {
        unsafe {
            signal(Signal::SIGCHLD, SigHandler::SigIgn).context("ignore SIGCHLD")?;
            signal(Signal::SIGPIPE, SigHandler::SigIgn).context("ignore SIGPIPE")?;
        }

        let fd = socket::socket(
            AddressFamily::Inet,
            SockType::Datagram,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .context("create UDP socket")?;
        socket::setsockopt(&fd, ReuseAddr, &true).context("setsockopt SO_REUSEADDR")?;
        socket::bind(fd.as_raw_fd(), &SockaddrIn::new(0, 0, 0, 0, port))
            .with_context(|| format!("bind UDP port {port}"))?;

        let sock = UdpSocket::from_std(std::net::UdpSocket::from(fd))
            .context("register UDP socket with the runtime")?;
        event("udp", None, format!("server started on port {port}"));
        Ok(Self { sock, port })
    }

    /// Waits up to `timeout_ms` for a single datagram. `Ok(None)` is a quiet
    /// tick (timeout or signal wakeup); receive errors are fatal to the
    /// endpoint and terminate the supervisor loop.
    pub async fn poll(
        &self,
        timeout_ms: u64,
        buf: &mut [u8],
    ) -> anyhow::Result<Option<(usize, SocketAddr)>> {
        match tokio::time::timeout(Duration::from_millis(timeout_ms), self.sock.recv_from(buf)).await
        {
            Err(_) => Ok(None),
            Ok(Ok((len, peer))) => Ok(Some((len, peer))),
            Ok(Err(e)) if e.kind() == ErrorKind::Interrupted => Ok(None),
            Ok(Err(e)) => Err(e).context("recvfrom"),
        }
    }

    pub fn stop(self) {
        event("udp", None, format!("server on port {} stopped", self.port));
    }
}
