//! Splits a payload into chunks and pairs each chunk's OUT transfer with the IN transfer that
//! reads back its echo
//!
//! Every chunk is a small state machine (`Pair`) advanced by the completions the dispatcher
//! feeds into `Batch::advance`:
//!
//! ``` text
//! queued -> OUT pending -> staged -> IN pending -> verified
//!                 \                      \
//!                  +-> failed             +-> failed
//! ```
//!
//! IN transfers are submitted in chunk order, which matches the order in which the device
//! queues the echoes, even if the OUT completions are observed out of order. The device hands
//! its queued echoes to the IN transfers in the order they were submitted, so the completions
//! of the IN transfers are processed in submission order: the n-th IN that carries data holds
//! the n-th owed echo, whatever order the completions are observed in. An IN that times out
//! leaves its echo queued on the device; it is read again by a new IN transfer.

use core::time::Duration;
use std::collections::{BTreeMap, VecDeque};

use log::{debug, trace, warn};

use crate::{
    ledger::Ledger,
    throughput::Throughput,
    transfer::{Direction, Handle, Status, Transfer, Transport},
    CancelPolicy, Config, Error, Mode,
};

/// Consecutive IN timeouts tolerated while waiting for the same echo
const MAX_ECHO_RETRIES: usize = 3;

/// Lifecycle of a batch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Some transfer is outstanding or some chunk has not been submitted yet
    Active,
    /// Every transfer the batch created is terminal; the next batch may begin
    Drained,
}

#[derive(Clone, Copy, Debug, Default)]
struct Slot {
    handle: Option<Handle>,
    // `None` = never submitted
    status: Option<Status>,
}

impl Slot {
    fn is_pending(&self) -> bool {
        self.status == Some(Status::Pending)
    }
}

#[derive(Debug, Default)]
struct Pair {
    tx: Slot,
    rx: Slot,
    // OUT finished; waits for the echoes of earlier chunks to be submitted first
    staged: Option<Transfer>,
    // submission order of the IN transfer tagged with this chunk
    seq: u64,
}

impl Pair {
    fn slot_mut(&mut self, direction: Direction) -> &mut Slot {
        match direction {
            Direction::Out => &mut self.tx,
            Direction::In => &mut self.rx,
        }
    }
}

/// One payload on its way through the pipeline
pub struct Batch {
    index: u64,
    mode: Mode,
    out_endpoint: u8,
    in_endpoint: u8,
    chunk_size: usize,
    timeout: Duration,
    depth: usize,
    policy: CancelPolicy,
    verify: bool,

    payload: Vec<u8>,
    pairs: Vec<Pair>,
    ledger: Ledger,

    // next chunk to submit
    next: usize,
    // next chunk whose echo has to be submitted
    next_echo: usize,
    // chunks whose echo the device still owes us, in the order it queued them
    echoes: VecDeque<usize>,
    // IN transfers by submission order; `Some` once completed but not yet processed
    readers: BTreeMap<u64, Option<Transfer>>,
    next_seq: u64,
    // consecutive timeouts while reading the echo at the front of `echoes`
    retries: usize,
    // pairs between their first submission and their retirement
    active: usize,
    // transfers owned by the transport
    outstanding: usize,
    // no new pairs will be started
    stopped: bool,
    // a fatal error occurred; completions only hand back buffers
    aborting: bool,
}

impl Batch {
    /// Prepares `payload` for submission
    ///
    /// Fails if the payload length is not a multiple of the chunk size; nothing is submitted
    /// until `start` is called. In IN-only mode only the length of `payload` matters
    pub fn new(index: u64, payload: Vec<u8>, config: &Config) -> Result<Self, Error> {
        config.validate()?;

        if payload.len() % config.chunk_size != 0 {
            return Err(Error::Config(format!(
                "payload length ({}) is not a multiple of the chunk size ({})",
                payload.len(),
                config.chunk_size
            )));
        }

        let chunks = payload.len() / config.chunk_size;
        Ok(Self {
            index,
            mode: config.mode,
            out_endpoint: config.out_endpoint,
            in_endpoint: config.in_endpoint,
            chunk_size: config.chunk_size,
            timeout: config.timeout,
            depth: config.depth,
            policy: config.cancel_policy,
            verify: config.verify,

            payload,
            pairs: (0..chunks).map(|_| Pair::default()).collect(),
            ledger: Ledger::new(),

            next: 0,
            next_echo: 0,
            echoes: VecDeque::new(),
            readers: BTreeMap::new(),
            next_seq: 0,
            retries: 0,
            active: 0,
            outstanding: 0,
            stopped: false,
            aborting: false,
        })
    }

    /// Position of this batch in the session
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Number of chunks
    pub fn chunks(&self) -> usize {
        self.pairs.len()
    }

    /// Transfers currently owned by the transport
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// `Drained` once every transfer the batch created is terminal and no more will be created
    pub fn state(&self) -> State {
        if self.outstanding == 0 && (self.stopped || self.next == self.pairs.len()) {
            State::Drained
        } else {
            State::Active
        }
    }

    /// Shorthand for `state() == State::Drained`
    pub fn is_drained(&self) -> bool {
        self.state() == State::Drained
    }

    /// Every transfer the batch created so far, as `(chunk, direction, status)`
    pub fn transfers(&self) -> Vec<(usize, Direction, Status)> {
        let mut transfers = vec![];
        for (chunk, pair) in self.pairs.iter().enumerate() {
            for (direction, slot) in [(Direction::Out, &pair.tx), (Direction::In, &pair.rx)].iter()
            {
                if let Some(status) = slot.status {
                    transfers.push((chunk, *direction, status));
                }
            }
        }
        transfers
    }

    /// Submits the first pairs, up to the configured pipeline depth
    pub fn start<T>(&mut self, transport: &mut T, throughput: &mut Throughput) -> Result<(), Error>
    where
        T: Transport + ?Sized,
    {
        debug!(
            "batch {}: {} bytes in {} chunks of {} bytes",
            self.index,
            self.payload.len(),
            self.pairs.len(),
            self.chunk_size
        );

        self.refill(transport, throughput)
    }

    /// Continuation of a completed transfer of this batch
    ///
    /// A successful OUT leads to the submission of its echo; a successful IN is verified and
    /// accounted. Timeouts fail the chunk but not the batch; in loopback mode a timed-out IN is
    /// first resubmitted, up to `MAX_ECHO_RETRIES` times in a row, since its echo is still
    /// queued on the device. Any other transport error and any verification failure is
    /// returned; the caller is expected to `abort` the batch then
    pub fn advance<T>(
        &mut self,
        transport: &mut T,
        throughput: &mut Throughput,
        transfer: Transfer,
    ) -> Result<(), Error>
    where
        T: Transport + ?Sized,
    {
        let chunk = transfer.chunk();
        let direction = transfer.direction();
        let status = transfer.status();

        match self.pairs.get_mut(chunk).map(|pair| pair.slot_mut(direction)) {
            Some(slot) if slot.is_pending() => slot.status = Some(status),
            _ => {
                warn!(
                    "batch {}: ignoring completion of unknown {} transfer (chunk {})",
                    self.index, direction, chunk
                );
                return Ok(());
            }
        }
        self.outstanding -= 1;
        trace!(
            "batch {}: {} chunk {} -> {:?} ({} bytes)",
            self.index,
            direction,
            chunk,
            status,
            transfer.actual_length()
        );

        let chained = status == Status::Completed
            && self.mode == Mode::Loopback
            && direction == Direction::Out
            && !self.aborting
            && !(self.stopped && self.policy == CancelPolicy::Abort);

        if chained {
            self.pairs[chunk].staged = Some(transfer.into_echo(self.in_endpoint));
        } else if self.mode == Mode::Loopback && direction == Direction::In {
            let seq = self.pairs[chunk].seq;
            self.readers.insert(seq, Some(transfer));
            self.read_echoes(transport, throughput)?;
        } else {
            // the pair ends here, one way or another
            self.active -= 1;
            self.retire(throughput, chunk, transfer)?;
        }

        if !self.aborting {
            self.submit_echoes(transport)?;
            self.refill(transport, throughput)?;
        }

        debug_assert!(self.ledger.len() <= self.active);
        Ok(())
    }

    /// Stops starting new pairs. With `CancelPolicy::Abort` the outstanding transfers are
    /// cancelled as well; with `CancelPolicy::Drain` the pairs in flight run to completion
    pub fn stop<T>(&mut self, transport: &mut T)
    where
        T: Transport + ?Sized,
    {
        self.stopped = true;

        if self.policy == CancelPolicy::Abort {
            self.drop_staged();
            self.cancel_outstanding(transport);
        }
    }

    /// Cancels everything after a fatal error
    pub fn abort<T>(&mut self, transport: &mut T)
    where
        T: Transport + ?Sized,
    {
        self.stopped = true;
        self.aborting = true;
        self.drop_staged();
        self.cancel_outstanding(transport);
    }

    // Processes the completed IN transfers in submission order, up to the first one that is
    // still outstanding
    fn read_echoes<T>(
        &mut self,
        transport: &mut T,
        throughput: &mut Throughput,
    ) -> Result<(), Error>
    where
        T: Transport + ?Sized,
    {
        loop {
            let seq = match self.readers.iter().next() {
                Some((&seq, Some(_))) => seq,
                _ => return Ok(()),
            };

            if let Some(Some(transfer)) = self.readers.remove(&seq) {
                self.read_echo(transport, throughput, transfer)?;
            }
        }
    }

    fn read_echo<T>(
        &mut self,
        transport: &mut T,
        throughput: &mut Throughput,
        transfer: Transfer,
    ) -> Result<(), Error>
    where
        T: Transport + ?Sized,
    {
        let retry = transfer.status() == Status::Error(rusb::Error::Timeout)
            && self.retries < MAX_ECHO_RETRIES
            && !self.aborting
            && !(self.stopped && self.policy == CancelPolicy::Abort);

        if retry {
            self.retries += 1;
            warn!(
                "batch {}: IN transfer timed out after {:?}; reading echo {} again ({}/{})",
                self.index,
                transfer.timeout(),
                self.echoes.front().copied().unwrap_or_else(|| transfer.chunk()),
                self.retries,
                MAX_ECHO_RETRIES
            );
            throughput.record_timeout();
            return self.submit(transport, transfer.into_echo(self.in_endpoint));
        }

        self.retries = 0;
        // the data in this transfer is the oldest echo still owed
        let chunk = self
            .echoes
            .pop_front()
            .unwrap_or_else(|| transfer.chunk());
        self.active -= 1;
        self.retire(throughput, chunk, transfer)
    }

    fn retire(
        &mut self,
        throughput: &mut Throughput,
        chunk: usize,
        transfer: Transfer,
    ) -> Result<(), Error> {
        let direction = transfer.direction();

        match transfer.status() {
            // dropped before its echo was read back
            Status::Completed
                if self.aborting || (self.mode == Mode::Loopback && direction == Direction::Out) =>
            {
                self.ledger.discard(chunk);
                Ok(())
            }

            Status::Completed => self.account(throughput, chunk, &transfer),

            Status::Cancelled => {
                debug!(
                    "batch {}: {} transfer of chunk {} cancelled",
                    self.index, direction, chunk
                );
                self.ledger.discard(chunk);
                Ok(())
            }

            Status::Error(rusb::Error::Timeout) => {
                warn!(
                    "batch {}: {} transfer of chunk {} timed out after {:?}",
                    self.index,
                    direction,
                    chunk,
                    transfer.timeout()
                );
                throughput.record_timeout();
                self.ledger.discard(chunk);
                Ok(())
            }

            Status::Error(source) => {
                self.ledger.discard(chunk);
                Err(Error::Fault {
                    batch: self.index,
                    chunk,
                    direction,
                    endpoint: transfer.endpoint(),
                    source,
                })
            }

            Status::Pending => unreachable!("transport handed back a pending transfer"),
        }
    }

    fn account(
        &mut self,
        throughput: &mut Throughput,
        chunk: usize,
        transfer: &Transfer,
    ) -> Result<(), Error> {
        match (self.mode, transfer.direction()) {
            (Mode::Loopback, Direction::In) => {
                if self.verify {
                    self.ledger
                        .verify(chunk, transfer.data())
                        .map_err(|source| Error::Mismatch {
                            batch: self.index,
                            chunk,
                            source,
                        })?;
                }
            }

            (Mode::InOnly, Direction::In) => {
                if self.verify && transfer.actual_length() != transfer.len() {
                    return Err(Error::Mismatch {
                        batch: self.index,
                        chunk,
                        source: crate::VerificationError::Length {
                            expected: transfer.len(),
                            received: transfer.actual_length(),
                        },
                    });
                }
            }

            (Mode::OutOnly, Direction::Out) => {}

            (mode, direction) => unreachable!("{:?} transfer in {:?} mode", direction, mode),
        }

        throughput.record_bytes(transfer.actual_length());
        Ok(())
    }

    // Starts new pairs until the pipeline is full
    fn refill<T>(&mut self, transport: &mut T, throughput: &mut Throughput) -> Result<(), Error>
    where
        T: Transport + ?Sized,
    {
        while !self.stopped && self.active < self.depth && self.next < self.pairs.len() {
            let chunk = self.next;
            self.next += 1;

            let start = chunk * self.chunk_size;
            let transfer = match self.mode {
                Mode::Loopback => {
                    let bytes = self.payload[start..start + self.chunk_size].to_vec();
                    if self.verify {
                        self.ledger.record(chunk, bytes.clone());
                    }
                    Transfer::outbound(self.out_endpoint, bytes, self.timeout, chunk)
                }

                Mode::OutOnly => {
                    let bytes = self.payload[start..start + self.chunk_size].to_vec();
                    Transfer::outbound(self.out_endpoint, bytes, self.timeout, chunk)
                }

                Mode::InOnly => {
                    Transfer::inbound(self.in_endpoint, self.chunk_size, self.timeout, chunk)
                }
            };

            throughput.start();
            self.submit(transport, transfer)?;
            self.active += 1;
        }

        Ok(())
    }

    // Submits staged echoes in chunk order
    fn submit_echoes<T>(&mut self, transport: &mut T) -> Result<(), Error>
    where
        T: Transport + ?Sized,
    {
        while self.next_echo < self.next {
            let pair = &mut self.pairs[self.next_echo];
            if pair.tx.is_pending() {
                // the device has not seen this chunk yet; later echoes must wait
                break;
            }
            let staged = pair.staged.take();
            self.next_echo += 1;

            if let Some(echo) = staged {
                let chunk = echo.chunk();
                if let Err(e) = self.submit(transport, echo) {
                    self.active -= 1;
                    return Err(e);
                }
                self.echoes.push_back(chunk);
            }
        }

        Ok(())
    }

    fn submit<T>(&mut self, transport: &mut T, transfer: Transfer) -> Result<(), Error>
    where
        T: Transport + ?Sized,
    {
        let chunk = transfer.chunk();
        let direction = transfer.direction();
        let endpoint = transfer.endpoint();

        match transport.submit(transfer) {
            Ok(handle) => {
                *self.pairs[chunk].slot_mut(direction) = Slot {
                    handle: Some(handle),
                    status: Some(Status::Pending),
                };
                if self.mode == Mode::Loopback && direction == Direction::In {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    self.pairs[chunk].seq = seq;
                    self.readers.insert(seq, None);
                }
                self.outstanding += 1;
                Ok(())
            }

            Err(source) => {
                self.ledger.discard(chunk);
                Err(Error::Fault {
                    batch: self.index,
                    chunk,
                    direction,
                    endpoint,
                    source,
                })
            }
        }
    }

    fn drop_staged(&mut self) {
        for (chunk, pair) in self.pairs.iter_mut().enumerate() {
            if pair.staged.take().is_some() {
                self.ledger.discard(chunk);
                self.active -= 1;
            }
        }
    }

    fn cancel_outstanding<T>(&mut self, transport: &mut T)
    where
        T: Transport + ?Sized,
    {
        for (chunk, pair) in self.pairs.iter().enumerate() {
            for (direction, slot) in [(Direction::Out, &pair.tx), (Direction::In, &pair.rx)].iter()
            {
                if let (true, Some(handle)) = (slot.is_pending(), slot.handle) {
                    match transport.cancel(handle) {
                        // already completed; it will be reaped anyway
                        Ok(()) | Err(rusb::Error::NotFound) => {}
                        Err(e) => warn!(
                            "batch {}: could not cancel {} transfer of chunk {}: {}",
                            self.index, direction, chunk, e
                        ),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        sim,
        throughput::Throughput,
        transfer::{Direction, Status, Transport as _},
        Config, Error, Mode,
    };

    use super::{Batch, State};

    fn config(chunk_size: usize) -> Config {
        Config {
            chunk_size,
            ..Config::default()
        }
    }

    #[test]
    fn rejects_partial_chunks() {
        match Batch::new(0, vec![0; 100], &config(64)) {
            Err(Error::Config(_)) => {}
            other => panic!("unexpected result: {:?}", other.map(|b| b.chunks())),
        }
    }

    #[test]
    fn empty_payload_is_drained() {
        let mut device = sim::Device::new(Mode::Loopback);
        let mut throughput = Throughput::new();
        let mut batch = Batch::new(0, vec![], &config(64)).unwrap();

        assert_eq!(batch.state(), State::Drained);
        batch.start(&mut device, &mut throughput).unwrap();
        assert_eq!(batch.state(), State::Drained);
        assert_eq!(device.submissions(), 0);
        assert!(batch.transfers().is_empty());
    }

    #[test]
    fn all_outs_up_front() {
        let mut device = sim::Device::new(Mode::Loopback);
        let mut throughput = Throughput::new();
        let mut batch = Batch::new(0, vec![0; 256], &config(64)).unwrap();

        batch.start(&mut device, &mut throughput).unwrap();
        assert_eq!(batch.outstanding(), 4);
        assert_eq!(device.in_flight(), 4);
        assert!(batch
            .transfers()
            .iter()
            .all(|&(_, dir, status)| dir == Direction::Out && status == Status::Pending));
    }

    #[test]
    fn depth_gates_submission() {
        let mut device = sim::Device::new(Mode::Loopback);
        let mut throughput = Throughput::new();
        let config = Config {
            depth: 1,
            ..config(64)
        };
        let mut batch = Batch::new(0, vec![0; 256], &config).unwrap();

        batch.start(&mut device, &mut throughput).unwrap();
        assert_eq!(batch.outstanding(), 1);

        // OUT 0 completes -> its echo is submitted, chunk 1 still waits
        let mut completed = vec![];
        device.handle_events(&mut completed).unwrap();
        for transfer in completed.drain(..) {
            batch.advance(&mut device, &mut throughput, transfer).unwrap();
        }
        assert_eq!(batch.outstanding(), 1);
        assert_eq!(
            batch.transfers(),
            vec![
                (0, Direction::Out, Status::Completed),
                (0, Direction::In, Status::Pending)
            ]
        );

        // echo 0 verified -> chunk 1 starts
        device.handle_events(&mut completed).unwrap();
        for transfer in completed.drain(..) {
            batch.advance(&mut device, &mut throughput, transfer).unwrap();
        }
        assert_eq!(throughput.bytes(), 64);
        assert_eq!(batch.transfers().last(), Some(&(1, Direction::Out, Status::Pending)));
    }

    #[test]
    fn ignores_foreign_completions() {
        let mut device = sim::Device::new(Mode::Loopback);
        let mut throughput = Throughput::new();
        let mut batch = Batch::new(0, vec![0; 64], &config(64)).unwrap();

        let mut stray = crate::Transfer::inbound(0x81, 64, Default::default(), 9);
        stray.complete(Status::Completed, 64);
        batch.advance(&mut device, &mut throughput, stray).unwrap();
        assert_eq!(throughput.bytes(), 0);
        assert!(batch.transfers().is_empty());
    }
}
