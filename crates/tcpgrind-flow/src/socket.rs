//! Socket factory with directed buffer sizing.
//!
//! Buffer sizes are applied right after `socket()` and before any connect:
//! several stacks ignore or mis-scale `SO_SNDBUF`/`SO_RCVBUF` changes on a
//! connected socket. The kernel is free to double or cap a request, so the
//! factory always reports the size read back, never the size asked for.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

/// Which socket buffer a request applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferDirection {
    /// `SO_SNDBUF`
    Send,
    /// `SO_RCVBUF`
    Receive,
}

impl BufferDirection {
    fn get(self, socket: &Socket) -> io::Result<usize> {
        match self {
            BufferDirection::Send => socket.send_buffer_size(),
            BufferDirection::Receive => socket.recv_buffer_size(),
        }
    }

    fn set(self, socket: &Socket, size: usize) -> io::Result<()> {
        match self {
            BufferDirection::Send => socket.set_send_buffer_size(size),
            BufferDirection::Receive => socket.set_recv_buffer_size(size),
        }
    }
}

impl fmt::Display for BufferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferDirection::Send => write!(f, "SO_SNDBUF"),
            BufferDirection::Receive => write!(f, "SO_RCVBUF"),
        }
    }
}

/// Requested buffer sizes; 0 means "kernel default".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferRequest {
    /// Requested `SO_SNDBUF`.
    pub send: usize,
    /// Requested `SO_RCVBUF`.
    pub receive: usize,
}

/// A fresh stream socket and the buffer sizes the kernel granted it.
#[derive(Debug)]
pub struct NegotiatedSocket {
    /// The socket, not yet connected.
    pub socket: Socket,
    /// Effective `SO_SNDBUF`.
    pub send_buffer_size: usize,
    /// Effective `SO_RCVBUF`.
    pub read_buffer_size: usize,
}

/// Requests `requested` bytes for one buffer and returns what the kernel applied.
///
/// A rejected request is retried at 7/8 of the previous attempt while the
/// attempt still exceeds the current size. A request of 0 only reads back.
pub fn set_window_size_directed(
    socket: &Socket,
    requested: usize,
    direction: BufferDirection,
) -> io::Result<usize> {
    let current = direction.get(socket)?;
    if requested == 0 {
        return Ok(current);
    }

    let mut attempt = requested.min(i32::MAX as usize);
    loop {
        match direction.set(socket, attempt) {
            Ok(()) => break,
            Err(e) => {
                let next = attempt - attempt / 8;
                if next <= current || next == attempt {
                    debug!(%direction, requested, error = %e, "buffer request rejected, keeping kernel size");
                    break;
                }
                attempt = next;
            }
        }
    }

    direction.get(socket)
}

/// Creates TCP stream sockets with negotiated buffer sizes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketFactory;

impl SocketFactory {
    /// Creates a new socket factory.
    pub fn new() -> Self {
        Self
    }

    /// Creates a stream socket for `addr`'s family and applies `request`.
    ///
    /// Only socket creation itself can fail; a direction whose size cannot be
    /// negotiated is logged and reported as 0.
    pub fn create(&self, addr: &SocketAddr, request: BufferRequest) -> io::Result<NegotiatedSocket> {
        let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;

        let send_buffer_size = negotiate(&socket, request.send, BufferDirection::Send, addr);
        let read_buffer_size = negotiate(&socket, request.receive, BufferDirection::Receive, addr);

        debug!(
            %addr,
            requested_send = request.send,
            requested_read = request.receive,
            send_buffer_size,
            read_buffer_size,
            "created data socket"
        );

        Ok(NegotiatedSocket {
            socket,
            send_buffer_size,
            read_buffer_size,
        })
    }
}

fn negotiate(socket: &Socket, requested: usize, direction: BufferDirection, addr: &SocketAddr) -> usize {
    match set_window_size_directed(socket, requested, direction) {
        Ok(size) => size,
        Err(e) => {
            warn!(%addr, %direction, requested, error = %e, "failed to negotiate socket buffer size");
            0
        }
    }
}
