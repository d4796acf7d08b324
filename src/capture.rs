//! Packet source
//!
//! Capture threads read IPv4 packets from `AF_PACKET` datagram sockets and
//! feed them to the hooks: outgoing packets to `on_egress`, packets addressed
//! to this host to `on_ingress`. With more than one worker the sockets join a
//! single hash fanout group so each flow stays on one thread.

use crate::classify::Direction;
use crate::hook::HookDispatcher;
use crate::transport::Transport;
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info};

/// `sll_pkttype` values from `<linux/if_packet.h>`
pub mod pkttype {
    pub const HOST: u8 = 0;
    pub const BROADCAST: u8 = 1;
    pub const MULTICAST: u8 = 2;
    pub const OTHERHOST: u8 = 3;
    pub const OUTGOING: u8 = 4;
}

/// Maps a packet type to the hook that sees it. Foreign traffic is not observed.
pub fn direction_of(pkttype: u8) -> Option<Direction> {
    match pkttype {
        pkttype::OUTGOING => Some(Direction::Egress),
        pkttype::HOST | pkttype::BROADCAST | pkttype::MULTICAST => Some(Direction::Ingress),
        _ => None,
    }
}

/// Running capture threads. Dropping it stops and joins them.
pub struct Capture {
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl Capture {
    /// Opens `workers` capture sockets and starts one thread per socket.
    ///
    /// All sockets are opened before the first thread starts; if a thread
    /// cannot be spawned the ones already running are stopped.
    pub fn start<T>(hooks: HookDispatcher<T>, interface: Option<&str>, workers: usize) -> Result<Self>
    where
        T: Transport + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut capture = Self {
            shutdown: Arc::clone(&shutdown),
            workers: Vec::new(),
        };

        for (id, socket) in sys::open(interface, workers.max(1))?.into_iter().enumerate() {
            let hooks = hooks.clone();
            let shutdown = Arc::clone(&shutdown);
            // On error `capture` is dropped, which joins the started threads.
            let handle = std::thread::Builder::new()
                .name(format!("ncp-capture-{}", id))
                .spawn(move || sys::run_worker(id, socket, hooks, shutdown))
                .map_err(|e| crate::NcpError::resource_init("capture thread", e))?;
            capture.workers.push(handle);
        }

        info!(
            "Capturing on {} with {} worker(s)",
            interface.unwrap_or("all interfaces"),
            capture.workers.len()
        );
        Ok(capture)
    }

    /// Stops the capture threads and waits for them to exit.
    pub fn stop(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().map(str::to_owned);
            if handle.join().is_err() {
                error!("Capture thread {:?} panicked", name);
            }
        }
        debug!("Capture stopped");
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.join();
        }
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use super::direction_of;
    use crate::hook::HookDispatcher;
    use crate::transport::Transport;
    use crate::{NcpError, Result};
    use std::ffi::CString;
    use std::io;
    use std::mem;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tracing::{debug, info, warn};

    const ETH_P_IP: u16 = 0x0800;
    const PACKET_FANOUT: libc::c_int = 18;
    const PACKET_FANOUT_HASH: u32 = 0;
    /// Largest IPv4 datagram
    const RECV_BUF_LEN: usize = 65_535;
    /// How long a worker blocks before checking the shutdown flag
    const POLL_INTERVAL_USEC: libc::suseconds_t = 200_000;

    /// Opens one capture socket per worker.
    pub(super) fn open(interface: Option<&str>, workers: usize) -> Result<Vec<OwnedFd>> {
        check_capabilities();

        let ifindex = match interface {
            Some(name) => Some(interface_index(name)?),
            None => None,
        };
        let fanout_group = std::process::id() & 0xFFFF;

        let mut sockets = Vec::with_capacity(workers);
        for _ in 0..workers {
            let socket = open_socket(ifindex)?;
            if workers > 1 {
                join_fanout(&socket, fanout_group)?;
            }
            sockets.push(socket);
        }
        Ok(sockets)
    }

    pub(super) fn run_worker<T: Transport>(
        id: usize,
        socket: OwnedFd,
        hooks: HookDispatcher<T>,
        shutdown: Arc<AtomicBool>,
    ) {
        debug!("Capture worker {} started", id);
        let mut buf = vec![0u8; RECV_BUF_LEN];

        while !shutdown.load(Ordering::Relaxed) {
            // SAFETY: sockaddr_ll is plain data and valid when zeroed
            let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
            let mut addr_len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;

            // SAFETY: buf and addr outlive the call and their lengths are passed alongside
            let n = unsafe {
                libc::recvfrom(
                    socket.as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                    0,
                    (&mut addr as *mut libc::sockaddr_ll).cast(),
                    &mut addr_len,
                )
            };

            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted => continue,
                    _ => {
                        warn!("Capture worker {} stopping: {}", id, err);
                        break;
                    }
                }
            }

            let packet = &buf[..n as usize];
            if let Some(direction) = direction_of(addr.sll_pkttype) {
                hooks.dispatch(packet, direction);
            }
        }
        debug!("Capture worker {} exiting", id);
    }

    fn open_socket(ifindex: Option<libc::c_int>) -> Result<OwnedFd> {
        let protocol = ETH_P_IP.to_be() as libc::c_int;

        // SAFETY: plain socket(2) call
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                protocol,
            )
        };
        if fd < 0 {
            return Err(NcpError::resource_init(
                "capture socket",
                format!(
                    "{} (CAP_NET_RAW is required)",
                    io::Error::last_os_error()
                ),
            ));
        }
        // SAFETY: fd was just returned by socket(2) and is owned by nobody else
        let socket = unsafe { OwnedFd::from_raw_fd(fd) };

        let timeout = libc::timeval {
            tv_sec: 0,
            tv_usec: POLL_INTERVAL_USEC,
        };
        setsockopt(&socket, libc::SOL_SOCKET, libc::SO_RCVTIMEO, &timeout, "SO_RCVTIMEO")?;

        if let Some(ifindex) = ifindex {
            // SAFETY: sockaddr_ll is plain data and valid when zeroed
            let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
            addr.sll_family = libc::AF_PACKET as libc::c_ushort;
            addr.sll_protocol = ETH_P_IP.to_be();
            addr.sll_ifindex = ifindex;

            // SAFETY: addr is a fully initialised sockaddr_ll of the length given
            let rc = unsafe {
                libc::bind(
                    socket.as_raw_fd(),
                    (&addr as *const libc::sockaddr_ll).cast(),
                    mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                return Err(NcpError::resource_init(
                    "capture socket",
                    format!("bind to ifindex {}: {}", ifindex, io::Error::last_os_error()),
                ));
            }
        }
        Ok(socket)
    }

    fn join_fanout(socket: &OwnedFd, group: u32) -> Result<()> {
        let arg: u32 = group | (PACKET_FANOUT_HASH << 16);
        setsockopt(socket, libc::SOL_PACKET, PACKET_FANOUT, &arg, "PACKET_FANOUT")
    }

    fn setsockopt<V>(
        socket: &OwnedFd,
        level: libc::c_int,
        name: libc::c_int,
        value: &V,
        label: &str,
    ) -> Result<()> {
        // SAFETY: value points to a live V and its exact size is passed
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                level,
                name,
                (value as *const V).cast(),
                mem::size_of::<V>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(NcpError::resource_init(
                "capture socket",
                format!("{}: {}", label, io::Error::last_os_error()),
            ));
        }
        Ok(())
    }

    fn interface_index(name: &str) -> Result<libc::c_int> {
        let c_name = CString::new(name)
            .map_err(|_| NcpError::ConfigError(format!("invalid interface name {:?}", name)))?;
        // SAFETY: c_name is a valid NUL-terminated string
        let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if index == 0 {
            return Err(NcpError::resource_init(
                "capture socket",
                format!("interface {}: {}", name, io::Error::last_os_error()),
            ));
        }
        Ok(index as libc::c_int)
    }

    fn check_capabilities() {
        // SAFETY: geteuid cannot fail
        let euid = unsafe { libc::geteuid() };
        if euid != 0 {
            warn!(
                "Not running as root (euid={}). Ensure CAP_NET_RAW is granted.",
                euid
            );
        } else {
            info!("Running with root privileges");
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use crate::hook::HookDispatcher;
    use crate::transport::Transport;
    use crate::{NcpError, Result};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    pub(super) enum Never {}

    pub(super) fn open(_interface: Option<&str>, _workers: usize) -> Result<Vec<Never>> {
        Err(NcpError::UnsupportedFeature(
            "packet capture requires Linux AF_PACKET sockets".into(),
        ))
    }

    pub(super) fn run_worker<T: Transport>(
        _id: usize,
        socket: Never,
        _hooks: HookDispatcher<T>,
        _shutdown: Arc<AtomicBool>,
    ) {
        match socket {}
    }
}
