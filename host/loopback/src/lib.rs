//! Bulk-transfer benchmark for the loopback firmware
//!
//! The device inverts every byte it receives on its bulk OUT endpoint and sends it back on its
//! bulk IN endpoint. This crate keeps many OUT and IN transfers in flight at once, chains the
//! read-back of every chunk to the completion of the write that sent it, verifies the echoes and
//! measures the throughput. Everything runs on the calling thread: the only place where it
//! blocks is the transport's event handling.
//!
//! ``` text
//! payload -> Batch (chunks, OUT) -> dispatch (poll) -> Batch::advance (IN, verify) -> Throughput
//! ```

#![deny(rust_2018_idioms)]
#![deny(warnings)]

use core::{
    cmp,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use std::sync::Arc;

use log::{debug, info};

// comment indicates the abstraction level (0: lowest, 9: highest)
pub mod dispatch; // 2
mod ledger; // 0
pub mod libusb; // 0
mod payload; // 0
pub mod scheduler; // 1
pub mod sim; // 0
mod throughput; // 0
mod transfer; // 0

pub use crate::{
    ledger::{check_echo, invert, Ledger, VerificationError},
    libusb::Libusb,
    payload::{Pattern, Payloads},
    throughput::{Throughput, ThroughputReport},
    transfer::{Direction, Handle, Status, Transfer, Transport},
};

/// Test mode, on both sides of the link
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// OUT data comes back inverted on IN and is verified
    Loopback,
    /// Host to device only
    OutOnly,
    /// Device to host only
    InOnly,
}

impl Mode {
    /// Value of the `SET_TEST_MODE` vendor request
    pub fn wire_value(self) -> u16 {
        match self {
            Mode::Loopback => consts::TEST_MODE_LOOPBACK,
            Mode::OutOnly => consts::TEST_MODE_OUT_ONLY,
            Mode::InOnly => consts::TEST_MODE_IN_ONLY,
        }
    }
}

/// What happens to the transfers in flight when cancellation is requested
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelPolicy {
    /// Let the pairs in flight finish, echoes included
    Drain,
    /// Cancel the outstanding transfers
    Abort,
}

/// Benchmark parameters
#[derive(Clone, Debug)]
pub struct Config {
    pub mode: Mode,
    pub out_endpoint: u8,
    pub in_endpoint: u8,
    /// Bytes per transfer; normally the endpoint's max packet size
    pub chunk_size: usize,
    /// Bytes per batch; a multiple of `chunk_size`
    pub batch_size: usize,
    /// Stop after this many bytes; `None` runs until cancelled
    pub total_bytes: Option<u64>,
    pub timeout: Duration,
    /// Maximum number of chunks in flight
    pub depth: usize,
    pub cancel_policy: CancelPolicy,
    /// Check the echoes (loopback) or the packet lengths (IN-only)
    pub verify: bool,
    pub pattern: Pattern,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Loopback,
            out_endpoint: consts::EPOUT1,
            in_endpoint: consts::EPIN1,
            chunk_size: consts::BULK_MPS.into(),
            batch_size: 512,
            total_bytes: None,
            timeout: Duration::from_millis(1_000),
            // every chunk of a batch is submitted up front
            depth: usize::max_value(),
            cancel_policy: CancelPolicy::Drain,
            verify: true,
            pattern: Pattern::Aa5500ff,
        }
    }
}

impl Config {
    /// Rejects parameters the pipeline can't honor, before anything is submitted
    pub fn validate(&self) -> Result<(), Error> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk size must be non-zero".into()));
        }

        if self.batch_size % self.chunk_size != 0 {
            return Err(Error::Config(format!(
                "batch size ({}) is not a multiple of the chunk size ({})",
                self.batch_size, self.chunk_size
            )));
        }

        if let Some(total) = self.total_bytes {
            if total % self.chunk_size as u64 != 0 {
                return Err(Error::Config(format!(
                    "total size ({}) is not a multiple of the chunk size ({})",
                    total, self.chunk_size
                )));
            }
        }

        if self.depth == 0 {
            return Err(Error::Config("pipeline depth must be non-zero".into()));
        }

        if Direction::of(self.out_endpoint) != Direction::Out {
            return Err(Error::Config(format!(
                "endpoint {:#04x} is not an OUT endpoint",
                self.out_endpoint
            )));
        }

        if Direction::of(self.in_endpoint) != Direction::In {
            return Err(Error::Config(format!(
                "endpoint {:#04x} is not an IN endpoint",
                self.in_endpoint
            )));
        }

        Ok(())
    }
}

/// Cancellation request shared between the pipeline and, say, a Ctrl-C handler
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// A token that has not been cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; this can be called from any thread
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed)
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Errors that end a run
///
/// Transfer timeouts are not in here: they only fail their chunk and are counted in the
/// `ThroughputReport`. Neither is cancellation, which ends the run with `Ok`
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A transfer stalled, the device went away, or a submission was refused
    #[error("{direction} transfer on endpoint {endpoint:#04x} failed (batch {batch}, chunk {chunk}): {source}")]
    Fault {
        batch: u64,
        chunk: usize,
        direction: Direction,
        endpoint: u8,
        source: rusb::Error,
    },

    #[error("event handling failed: {0}")]
    Events(#[source] rusb::Error),

    /// Data corruption on the link
    #[error("verification of batch {batch}, chunk {chunk} failed: {source}")]
    Mismatch {
        batch: u64,
        chunk: usize,
        source: VerificationError,
    },
}

/// Runs the benchmark described by `config` over `transport`
pub fn run<T>(
    transport: &mut T,
    config: &Config,
    cancel: &CancellationToken,
) -> Result<ThroughputReport, Error>
where
    T: Transport + ?Sized,
{
    run_with_progress(transport, config, cancel, |_| {})
}

/// Like `run` but calls `progress` after every batch
pub fn run_with_progress<T, F>(
    transport: &mut T,
    config: &Config,
    cancel: &CancellationToken,
    mut progress: F,
) -> Result<ThroughputReport, Error>
where
    T: Transport + ?Sized,
    F: FnMut(&Throughput),
{
    config.validate()?;

    info!(
        "{:?} test: {} byte chunks, {} byte batches, {}",
        config.mode,
        config.chunk_size,
        config.batch_size,
        match config.total_bytes {
            Some(total) => format!("{} bytes in total", total),
            None => "until cancelled".to_string(),
        }
    );

    let mut throughput = Throughput::new();
    let mut payloads = Payloads::new(config.pattern);
    let mut remaining = config.total_bytes;
    let mut index = 0;
    let mut cancelled = false;
    loop {
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }

        let len = match remaining {
            Some(0) => break,
            Some(n) => cmp::min(n, config.batch_size as u64) as usize,
            None => config.batch_size,
        };

        let mut batch = scheduler::Batch::new(index, payloads.next(len), config)?;
        let outcome = dispatch::run_until_drained(transport, &mut batch, &mut throughput, cancel)?;
        progress(&throughput);

        if let Some(remaining) = remaining.as_mut() {
            *remaining -= len as u64;
        }
        index += 1;

        if outcome == dispatch::Outcome::Cancelled {
            cancelled = true;
            break;
        }

        if len == 0 {
            debug!("empty batch; nothing else to do");
            break;
        }
    }

    let report = throughput.finish(cancelled);
    info!("{}", report);
    Ok(report)
}
