//! Driver event intake
//!
//! The kernel driver is a pre-existing component; the agent consumes its
//! per-CPU ringbuffer records through the [`EventSource`] seam. The
//! concrete transport here is a unix datagram socket carrying one
//! `RawEvent` per datagram; anything with the wrong size is counted as
//! malformed and skipped. A socket error other than "nothing pending" is
//! fatal: the driver handle is gone and the agent shuts down.

use std::io;
use std::mem;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;

use spyglass_common::RawEvent;
use thiserror::Error;

use crate::stats::PipelineStats;

/// Events drained per poll; bounds latency of shutdown checks.
pub const MAX_BATCH_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver socket error: {0}")]
    Io(#[from] io::Error),

    #[error("driver event stream disconnected")]
    Disconnected,
}

pub trait EventSource: Send {
    /// Drain up to `max` pending events without blocking. An error means
    /// the driver handle is lost; the caller shuts down.
    fn poll(&mut self, max: usize) -> Result<Vec<RawEvent>, DriverError>;
}

/// Unix datagram consumer of driver records.
pub struct UnixSocketSource {
    socket: UnixDatagram,
    stats: Arc<PipelineStats>,
}

impl UnixSocketSource {
    pub fn bind(path: &Path, stats: Arc<PipelineStats>) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // A stale socket file from a previous run would fail the bind.
        let _ = std::fs::remove_file(path);
        let socket = UnixDatagram::bind(path)?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket, stats })
    }

    pub fn from_socket(socket: UnixDatagram, stats: Arc<PipelineStats>) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self { socket, stats })
    }
}

impl EventSource for UnixSocketSource {
    fn poll(&mut self, max: usize) -> Result<Vec<RawEvent>, DriverError> {
        let expected = mem::size_of::<RawEvent>();
        let mut buf = [0u8; mem::size_of::<RawEvent>()];
        let mut events = Vec::new();

        while events.len() < max {
            match self.socket.recv(&mut buf) {
                Ok(len) if len == expected => {
                    let event: RawEvent =
                        unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const RawEvent) };
                    events.push(event);
                }
                Ok(_) => {
                    PipelineStats::bump(&self.stats.malformed);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(DriverError::Io(err)),
            }
        }
        Ok(events)
    }
}

/// Channel-backed source for tests and in-process drivers.
pub struct ChannelSource {
    rx: mpsc::Receiver<RawEvent>,
}

impl ChannelSource {
    pub fn new() -> (mpsc::Sender<RawEvent>, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, Self { rx })
    }
}

impl EventSource for ChannelSource {
    fn poll(&mut self, max: usize) -> Result<Vec<RawEvent>, DriverError> {
        let mut events = Vec::new();
        while events.len() < max {
            match self.rx.try_recv() {
                Ok(event) => events.push(event),
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => {
                    if events.is_empty() {
                        return Err(DriverError::Disconnected);
                    }
                    break;
                }
            }
        }
        Ok(events)
    }
}
