//! Supervisor ↔ worker channel.
//!
//! Per request the supervisor passes one client descriptor and the worker
//! answers with two lines: an acknowledgment and the decimal pid of the
//! process serving the request.

pub mod fd;
pub mod request;

use std::io::{self, BufRead, BufReader, Write};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Condvar, Mutex};

use crate::supervisor::error::SupervisorError;
pub use request::Request;

/// Acknowledgment line written by the worker on receipt of a client.
pub const ACK: &str = "ok";

// ─── Supervisor side ─────────────────────────────────────────

/// Supervisor end of the channel paired with exactly one worker.
pub struct WorkerChannel {
    stream: UnixStream,
    reader: Mutex<BufReader<UnixStream>>,
    in_flight: Mutex<bool>,
    turn: Condvar,
}

impl WorkerChannel {
    /// Create a connected pair: the supervisor keeps the channel, the worker
    /// gets the endpoint.
    pub fn pair() -> io::Result<(Self, WorkerEndpoint)> {
        let (near, far) = UnixStream::pair()?;
        let reader = BufReader::new(near.try_clone()?);
        let channel = Self {
            stream: near,
            reader: Mutex::new(reader),
            in_flight: Mutex::new(false),
            turn: Condvar::new(),
        };
        Ok((channel, WorkerEndpoint { stream: far }))
    }

    /// Claim the channel for one request/response cycle. Blocks while another
    /// caller's cycle is still reading its lines.
    pub fn begin(self: &Arc<Self>) -> Result<Exchange, SupervisorError> {
        let mut busy = self.in_flight.lock().map_err(|_| SupervisorError::LockPoisoned)?;
        while *busy {
            busy = self.turn.wait(busy).map_err(|_| SupervisorError::LockPoisoned)?;
        }
        *busy = true;
        Ok(Exchange { channel: Arc::clone(self) })
    }

    fn release(&self) {
        if let Ok(mut busy) = self.in_flight.lock() {
            *busy = false;
        }
        self.turn.notify_one();
    }
}

impl AsRawFd for WorkerChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// One request cycle on a [`WorkerChannel`]. Dropping it hands the channel to
/// the next caller.
pub struct Exchange {
    channel: Arc<WorkerChannel>,
}

impl Exchange {
    /// Pass the client connection to the worker.
    pub fn send_client(&self, client: BorrowedFd<'_>) -> Result<(), SupervisorError> {
        fd::send_fd(&self.channel.stream, client)?;
        Ok(())
    }

    /// Read one line, without its terminator. EOF means the worker is gone.
    pub fn read_line(&self) -> Result<String, SupervisorError> {
        let mut reader = self.channel.reader.lock().map_err(|_| SupervisorError::LockPoisoned)?;
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(SupervisorError::Disconnected(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "worker closed the channel",
            )));
        }
        Ok(line.trim_end_matches(['\n', '\r']).to_string())
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.channel.release();
    }
}

/// Parse the worker's pid line.
pub fn parse_pid(line: &str) -> Option<u32> {
    line.trim().parse::<u32>().ok().filter(|pid| *pid > 0)
}

// ─── Worker side ─────────────────────────────────────────────

/// Worker end of the channel.
pub struct WorkerEndpoint {
    stream: UnixStream,
}

impl WorkerEndpoint {
    /// Wait for the next client. `Ok(None)` once the supervisor has dropped
    /// its end.
    pub fn recv_client(&self) -> io::Result<Option<OwnedFd>> {
        fd::recv_fd(&self.stream)
    }

    pub fn acknowledge(&self) -> io::Result<()> {
        self.write_line(ACK)
    }

    /// Report the pid of the process handling the current client.
    pub fn report_pid(&self, pid: u32) -> io::Result<()> {
        self.write_line(&pid.to_string())
    }

    /// Report that the current client could not be served.
    pub fn decline(&self) -> io::Result<()> {
        self.write_line("")
    }

    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut stream = &self.stream;
        stream.write_all(format!("{}\n", line).as_bytes())?;
        stream.flush()
    }
}

impl AsRawFd for WorkerEndpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl From<UnixStream> for WorkerEndpoint {
    fn from(stream: UnixStream) -> Self {
        Self { stream }
    }
}
