//! Platform socket capabilities.
//!
//! Congestion-control selection, path-MTU queries and `TCP_INFO` are not
//! portable. Each target provides a [`PlatformCapabilities`] implementation;
//! platforms lacking a feature inherit the default methods, which fail with
//! [`io::ErrorKind::Unsupported`]. The implementation is chosen once at
//! startup by [`detect`].

use std::fmt;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use socket2::Socket;
use tracing::debug;

/// Kernel limit on congestion control algorithm names (`TCP_CA_NAME_MAX`).
pub const CC_ALG_NAME_MAX: usize = 16;

pub(crate) fn setsockopt_int(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn getsockopt_int(fd: RawFd, level: libc::c_int, name: libc::c_int) -> io::Result<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            level,
            name,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}

fn unsupported(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{} is not supported on this platform", what),
    )
}

/// Which optional features the platform offers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    /// `TCP_CONGESTION` can be set and read back.
    pub congestion_control: bool,
    /// Path MTU can be queried on a connected socket.
    pub path_mtu: bool,
    /// Path-MTU discovery mode can be forced.
    pub pmtu_discovery: bool,
    /// `TCP_INFO` snapshots are available.
    pub tcp_info: bool,
    /// `TCP_CORK` is available.
    pub cork: bool,
}

/// Transport statistics read from the kernel for one socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpInfoSnapshot {
    /// TCP state (1 = established).
    pub state: u8,
    /// Congestion avoidance state.
    pub ca_state: u8,
    /// Retransmission timeout in microseconds.
    pub rto: u32,
    /// Sender MSS.
    pub snd_mss: u32,
    /// Receiver MSS.
    pub rcv_mss: u32,
    /// Unacknowledged segments.
    pub unacked: u32,
    /// Segments considered lost.
    pub lost: u32,
    /// Segments currently retransmitted.
    pub retrans: u32,
    /// Path MTU.
    pub pmtu: u32,
    /// Smoothed RTT in microseconds.
    pub rtt: u32,
    /// RTT variance in microseconds.
    pub rttvar: u32,
    /// Slow start threshold.
    pub snd_ssthresh: u32,
    /// Congestion window in segments.
    pub snd_cwnd: u32,
    /// Reordering metric.
    pub reordering: u32,
    /// Retransmissions over the connection lifetime.
    pub total_retrans: u32,
}

/// Leading part of the kernel's `struct tcp_info`, common to every Linux
/// version we run on. The kernel copies at most the length we pass.
#[cfg(target_os = "linux")]
#[repr(C)]
#[derive(Default)]
struct RawTcpInfo {
    tcpi_state: u8,
    tcpi_ca_state: u8,
    tcpi_retransmits: u8,
    tcpi_probes: u8,
    tcpi_backoff: u8,
    tcpi_options: u8,
    tcpi_wscale: u8,
    tcpi_flags: u8,
    tcpi_rto: u32,
    tcpi_ato: u32,
    tcpi_snd_mss: u32,
    tcpi_rcv_mss: u32,
    tcpi_unacked: u32,
    tcpi_sacked: u32,
    tcpi_lost: u32,
    tcpi_retrans: u32,
    tcpi_fackets: u32,
    tcpi_last_data_sent: u32,
    tcpi_last_ack_sent: u32,
    tcpi_last_data_recv: u32,
    tcpi_last_ack_recv: u32,
    tcpi_pmtu: u32,
    tcpi_rcv_ssthresh: u32,
    tcpi_rtt: u32,
    tcpi_rttvar: u32,
    tcpi_snd_ssthresh: u32,
    tcpi_snd_cwnd: u32,
    tcpi_advmss: u32,
    tcpi_reordering: u32,
    tcpi_rcv_rtt: u32,
    tcpi_rcv_space: u32,
    tcpi_total_retrans: u32,
}

#[cfg(target_os = "linux")]
impl From<RawTcpInfo> for TcpInfoSnapshot {
    fn from(raw: RawTcpInfo) -> Self {
        Self {
            state: raw.tcpi_state,
            ca_state: raw.tcpi_ca_state,
            rto: raw.tcpi_rto,
            snd_mss: raw.tcpi_snd_mss,
            rcv_mss: raw.tcpi_rcv_mss,
            unacked: raw.tcpi_unacked,
            lost: raw.tcpi_lost,
            retrans: raw.tcpi_retrans,
            pmtu: raw.tcpi_pmtu,
            rtt: raw.tcpi_rtt,
            rttvar: raw.tcpi_rttvar,
            snd_ssthresh: raw.tcpi_snd_ssthresh,
            snd_cwnd: raw.tcpi_snd_cwnd,
            reordering: raw.tcpi_reordering,
            total_retrans: raw.tcpi_total_retrans,
        }
    }
}

/// Platform-specific socket features used by the option tuner and reporting.
pub trait PlatformCapabilities: Send + Sync + fmt::Debug {
    /// Short platform name for logs.
    fn name(&self) -> &'static str;

    /// Features this implementation offers.
    fn capabilities(&self) -> CapabilitySet;

    /// Selects a congestion control algorithm.
    fn set_congestion_control(&self, _socket: &Socket, _alg: &str) -> io::Result<()> {
        Err(unsupported("TCP_CONGESTION"))
    }

    /// Reads back the congestion control algorithm in effect.
    fn congestion_control(&self, _socket: &Socket) -> io::Result<String> {
        Err(unsupported("TCP_CONGESTION"))
    }

    /// Forces path-MTU discovery (don't fragment).
    fn set_pmtu_discovery(&self, _socket: &Socket, _ipv6: bool) -> io::Result<()> {
        Err(unsupported("IP_MTU_DISCOVER"))
    }

    /// Path MTU of a connected (or connecting) socket.
    fn path_mtu(&self, _socket: &Socket, _ipv6: bool) -> io::Result<u32> {
        Err(unsupported("IP_MTU"))
    }

    /// Toggles `TCP_CORK`.
    fn set_cork(&self, _socket: &Socket, _on: bool) -> io::Result<()> {
        Err(unsupported("TCP_CORK"))
    }

    /// Current `TCP_INFO` snapshot.
    fn tcp_info(&self, _socket: &Socket) -> io::Result<TcpInfoSnapshot> {
        Err(unsupported("TCP_INFO"))
    }
}

/// Platform without any optional socket feature.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCapabilities;

impl PlatformCapabilities for NoCapabilities {
    fn name(&self) -> &'static str {
        "none"
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::default()
    }
}

/// Linux socket features.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy)]
pub struct LinuxCapabilities {
    caps: CapabilitySet,
}

#[cfg(target_os = "linux")]
impl LinuxCapabilities {
    /// Assumes every feature is present.
    pub fn assumed() -> Self {
        Self {
            caps: CapabilitySet {
                congestion_control: true,
                path_mtu: true,
                pmtu_discovery: true,
                tcp_info: true,
                cork: true,
            },
        }
    }

    /// Probes features on a throw-away TCP socket.
    pub fn probe() -> io::Result<Self> {
        let socket = Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
        let probe = Self::assumed();
        let fd = socket.as_raw_fd();

        let congestion_control = probe.congestion_control(&socket).is_ok();
        let tcp_info = probe.tcp_info(&socket).is_ok();
        // An unconnected socket answers ENOTCONN when IP_MTU exists at all.
        let path_mtu = match getsockopt_int(fd, libc::IPPROTO_IP, libc::IP_MTU) {
            Ok(_) => true,
            Err(e) => e.raw_os_error() != Some(libc::ENOPROTOOPT),
        };
        let pmtu_discovery = getsockopt_int(fd, libc::IPPROTO_IP, libc::IP_MTU_DISCOVER).is_ok();
        let cork = getsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_CORK).is_ok();

        let caps = CapabilitySet {
            congestion_control,
            path_mtu,
            pmtu_discovery,
            tcp_info,
            cork,
        };
        debug!(?caps, "probed linux socket capabilities");
        Ok(Self { caps })
    }
}

#[cfg(target_os = "linux")]
impl PlatformCapabilities for LinuxCapabilities {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn capabilities(&self) -> CapabilitySet {
        self.caps
    }

    fn set_congestion_control(&self, socket: &Socket, alg: &str) -> io::Result<()> {
        if !self.caps.congestion_control {
            return Err(unsupported("TCP_CONGESTION"));
        }
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_CONGESTION,
                alg.as_ptr() as *const libc::c_void,
                alg.len() as libc::socklen_t,
            )
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn congestion_control(&self, socket: &Socket) -> io::Result<String> {
        if !self.caps.congestion_control {
            return Err(unsupported("TCP_CONGESTION"));
        }
        let mut buf = [0u8; CC_ALG_NAME_MAX];
        let mut len = buf.len() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_CONGESTION,
                buf.as_mut_ptr() as *mut libc::c_void,
                &mut len,
            )
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        let name = &buf[..(len as usize).min(buf.len())];
        let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        Ok(String::from_utf8_lossy(&name[..end]).into_owned())
    }

    fn set_pmtu_discovery(&self, socket: &Socket, ipv6: bool) -> io::Result<()> {
        if !self.caps.pmtu_discovery {
            return Err(unsupported("IP_MTU_DISCOVER"));
        }
        let fd = socket.as_raw_fd();
        if ipv6 {
            setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_MTU_DISCOVER, libc::IPV6_PMTUDISC_DO)
        } else {
            setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_MTU_DISCOVER, libc::IP_PMTUDISC_DO)
        }
    }

    fn path_mtu(&self, socket: &Socket, ipv6: bool) -> io::Result<u32> {
        if !self.caps.path_mtu {
            return Err(unsupported("IP_MTU"));
        }
        let fd = socket.as_raw_fd();
        let mtu = if ipv6 {
            getsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_MTU)?
        } else {
            getsockopt_int(fd, libc::IPPROTO_IP, libc::IP_MTU)?
        };
        Ok(mtu.max(0) as u32)
    }

    fn set_cork(&self, socket: &Socket, on: bool) -> io::Result<()> {
        if !self.caps.cork {
            return Err(unsupported("TCP_CORK"));
        }
        setsockopt_int(socket.as_raw_fd(), libc::IPPROTO_TCP, libc::TCP_CORK, on as libc::c_int)
    }

    fn tcp_info(&self, socket: &Socket) -> io::Result<TcpInfoSnapshot> {
        if !self.caps.tcp_info {
            return Err(unsupported("TCP_INFO"));
        }
        let mut raw = RawTcpInfo::default();
        let mut len = mem::size_of::<RawTcpInfo>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_INFO,
                &mut raw as *mut RawTcpInfo as *mut libc::c_void,
                &mut len,
            )
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(raw.into())
    }
}

/// Chooses the capability implementation for the running platform.
pub fn detect(probe: bool) -> Arc<dyn PlatformCapabilities> {
    #[cfg(target_os = "linux")]
    {
        if !probe {
            return Arc::new(LinuxCapabilities::assumed());
        }
        match LinuxCapabilities::probe() {
            Ok(caps) => Arc::new(caps),
            Err(e) => {
                tracing::warn!(error = %e, "capability probe failed, disabling optional socket features");
                Arc::new(NoCapabilities)
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = probe;
        Arc::new(NoCapabilities)
    }
}
