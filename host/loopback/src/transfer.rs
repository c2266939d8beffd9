//! Asynchronous bulk transfers and the transport that executes them

use core::{fmt, time::Duration};

/// Direction of a transfer, from the host's point of view
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl Direction {
    /// Returns the direction encoded in bit 7 of an endpoint address
    pub fn of(endpoint: u8) -> Self {
        if endpoint & consts::EP_DIR_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Out => f.write_str("OUT"),
            Direction::In => f.write_str("IN"),
        }
    }
}

/// Transfer status
///
/// `Pending` is the only non-terminal state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// Owned by the transport
    Pending,
    /// Completed; `actual_length` bytes were moved
    Completed,
    /// Transport-level failure. `rusb::Error::Timeout` is reported when no completion happened
    /// within the transfer's timeout; `rusb::Error::Pipe` is an endpoint stall
    Error(rusb::Error),
    /// Cancelled before it completed
    Cancelled,
}

impl Status {
    /// Whether the transfer has left the `Pending` state
    pub fn is_terminal(self) -> bool {
        self != Status::Pending
    }
}

/// Identifies a submitted transfer for the purpose of cancelling it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u64);

/// One bulk transfer
///
/// The buffer belongs to the transport between `Transport::submit` and the moment the transfer
/// comes back out of `Transport::handle_events`
#[derive(Debug)]
pub struct Transfer {
    endpoint: u8,
    buffer: Vec<u8>,
    timeout: Duration,
    chunk: usize,
    status: Status,
    actual_length: usize,
}

impl Transfer {
    /// A host-to-device transfer that sends `bytes`
    pub fn outbound(endpoint: u8, bytes: Vec<u8>, timeout: Duration, chunk: usize) -> Self {
        debug_assert_eq!(Direction::of(endpoint), Direction::Out);

        Self {
            endpoint,
            buffer: bytes,
            timeout,
            chunk,
            status: Status::Pending,
            actual_length: 0,
        }
    }

    /// A device-to-host transfer that reads up to `len` bytes
    pub fn inbound(endpoint: u8, len: usize, timeout: Duration, chunk: usize) -> Self {
        debug_assert_eq!(Direction::of(endpoint), Direction::In);

        Self {
            endpoint,
            buffer: vec![0; len],
            timeout,
            chunk,
            status: Status::Pending,
            actual_length: 0,
        }
    }

    /// Turns a finished OUT transfer into the IN transfer that reads back its echo, reusing the
    /// allocation
    pub fn into_echo(self, endpoint: u8) -> Self {
        let mut buffer = self.buffer;
        let len = buffer.len();
        buffer.clear();
        buffer.resize(len, 0);

        Self::inbound_with(endpoint, buffer, self.timeout, self.chunk)
    }

    fn inbound_with(endpoint: u8, buffer: Vec<u8>, timeout: Duration, chunk: usize) -> Self {
        Self {
            endpoint,
            buffer,
            timeout,
            chunk,
            status: Status::Pending,
            actual_length: 0,
        }
    }

    /// Records the final status of the transfer
    ///
    /// # Panics
    ///
    /// This function panics if the transfer already reached a terminal state or if
    /// `actual_length` exceeds the requested length
    pub fn complete(&mut self, status: Status, actual_length: usize) {
        assert_eq!(
            self.status,
            Status::Pending,
            "transfer completed more than once"
        );
        assert!(status.is_terminal(), "transfer completed as `Pending`");
        assert!(
            actual_length <= self.buffer.len(),
            "transferred more bytes than requested"
        );

        self.status = status;
        self.actual_length = actual_length;
    }

    /// Endpoint address
    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    /// Direction, derived from the endpoint address
    pub fn direction(&self) -> Direction {
        Direction::of(self.endpoint)
    }

    /// Requested length in bytes
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether this is a zero-length transfer
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Timeout window
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Index of the chunk this transfer belongs to
    pub fn chunk(&self) -> usize {
        self.chunk
    }

    /// Current status
    pub fn status(&self) -> Status {
        self.status
    }

    /// Bytes actually moved
    pub fn actual_length(&self) -> usize {
        self.actual_length
    }

    /// The bytes that were actually moved
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_length]
    }

    /// Full buffer, for transports that fill IN transfers
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

/// Executes bulk transfers asynchronously
///
/// A transport is driven from a single thread: the one that calls `handle_events`
pub trait Transport {
    /// Hands `transfer` over to the transport; this never blocks
    fn submit(&mut self, transfer: Transfer) -> Result<Handle, rusb::Error>;

    /// Requests the cancellation of an outstanding transfer
    ///
    /// The transfer still comes back, with status `Cancelled` (or whatever status it reached
    /// first), out of a later `handle_events` call. Returns `rusb::Error::NotFound` if the
    /// transfer has already completed
    fn cancel(&mut self, handle: Handle) -> Result<(), rusb::Error>;

    /// Waits for at least one outstanding transfer to complete (or a short, bounded period)
    /// and moves every completed transfer into `completed`
    ///
    /// `rusb::Error::Interrupted` is benign; the caller should just call this again
    fn handle_events(&mut self, completed: &mut Vec<Transfer>) -> Result<(), rusb::Error>;

    /// Number of transfers the transport still owns
    fn in_flight(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use core::time::Duration;

    use super::{Direction, Status, Transfer};

    const TIMEOUT: Duration = Duration::from_millis(100);

    #[test]
    fn direction() {
        assert_eq!(Direction::of(0x01), Direction::Out);
        assert_eq!(Direction::of(0x02), Direction::Out);
        assert_eq!(Direction::of(0x81), Direction::In);
        assert_eq!(Direction::of(0x82), Direction::In);
        assert_eq!(Direction::In.to_string(), "IN");
    }

    #[test]
    fn echo_reuses_length_and_chunk() {
        let mut out = Transfer::outbound(0x01, vec![0xaa; 64], TIMEOUT, 3);
        out.complete(Status::Completed, 64);
        assert_eq!(out.data(), &[0xaa; 64][..]);

        let echo = out.into_echo(0x81);
        assert_eq!(echo.direction(), Direction::In);
        assert_eq!(echo.len(), 64);
        assert_eq!(echo.chunk(), 3);
        assert_eq!(echo.status(), Status::Pending);
        assert!(echo.data().is_empty());
    }

    #[test]
    fn terminal_states() {
        assert!(!Status::Pending.is_terminal());
        assert!(Status::Completed.is_terminal());
        assert!(Status::Cancelled.is_terminal());
        assert!(Status::Error(rusb::Error::Timeout).is_terminal());
    }

    #[test]
    #[should_panic(expected = "more than once")]
    fn no_transition_out_of_terminal_state() {
        let mut t = Transfer::inbound(0x81, 8, TIMEOUT, 0);
        t.complete(Status::Cancelled, 0);
        t.complete(Status::Completed, 8);
    }
}
