//! In-memory stand-in for the loopback firmware
//!
//! The device side behaves like the firmware: in loopback mode every OUT packet is inverted and
//! queued for the IN endpoint; IN transfers are served from that queue in submission order. On
//! top of that, faults, bit flips, interrupted polls and odd completion orders can be injected.

use core::{cmp, mem};
use std::collections::{BTreeMap, VecDeque};

use log::trace;
use rand::{rngs::StdRng, seq::SliceRandom as _, SeedableRng as _};

use crate::{
    ledger,
    transfer::{Direction, Handle, Status, Transfer, Transport},
    CancellationToken, Mode,
};

/// Byte the device sources in IN-only mode
const SOURCE_BYTE: u8 = 0xa5;

/// Order in which completed transfers are handed back
pub enum Order {
    /// Completion order
    Fifo,
    /// Most recently submitted first
    Reverse,
    /// Seeded random permutation on every poll
    Shuffle(u64),
    /// Ascending key; ties keep completion order
    ByKey(Box<dyn FnMut(&Transfer) -> usize>),
}

struct Entry {
    handle: Handle,
    seq: usize,
    transfer: Transfer,
}

/// Simulated device and host controller
pub struct Device {
    mode: Mode,
    order: Order,
    rng: StdRng,
    events_per_poll: usize,

    seq: usize,
    // submitted, not yet seen by the device
    pending: VecDeque<Entry>,
    // IN transfers waiting for data
    parked: VecDeque<Entry>,
    // completed, not yet handed back
    ready: Vec<Entry>,
    // device-side queue of echoes
    fifo: VecDeque<Vec<u8>>,

    faults: BTreeMap<(Direction, usize), rusb::Error>,
    corruptions: BTreeMap<(Direction, usize), usize>,
    interrupts: usize,
    // `handle_events` call that fails, and how
    poll_fault: Option<(usize, rusb::Error)>,
    polls: usize,
    trip: Option<(usize, CancellationToken)>,
    delivered: Vec<(Direction, usize)>,
}

impl Device {
    /// A device running the given test mode
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            order: Order::Fifo,
            rng: StdRng::seed_from_u64(0),
            events_per_poll: usize::max_value(),

            seq: 0,
            pending: VecDeque::new(),
            parked: VecDeque::new(),
            ready: vec![],
            fifo: VecDeque::new(),

            faults: BTreeMap::new(),
            corruptions: BTreeMap::new(),
            interrupts: 0,
            poll_fault: None,
            polls: 0,
            trip: None,
            delivered: vec![],
        }
    }

    /// Changes the order in which completions are handed back
    pub fn order(mut self, order: Order) -> Self {
        if let Order::Shuffle(seed) = order {
            self.rng = StdRng::seed_from_u64(seed);
        }
        self.order = order;
        self
    }

    /// Hands back at most `n` completions per `handle_events` call
    pub fn events_per_poll(mut self, n: usize) -> Self {
        assert!(n != 0, "`handle_events` must make progress");
        self.events_per_poll = n;
        self
    }

    /// The next `direction` transfer of `chunk` fails with `error`
    pub fn fail(mut self, direction: Direction, chunk: usize, error: rusb::Error) -> Self {
        self.faults.insert((direction, chunk), error);
        self
    }

    /// Flips bit `bit` of the next `direction` transfer of `chunk`
    pub fn corrupt(mut self, direction: Direction, chunk: usize, bit: usize) -> Self {
        self.corruptions.insert((direction, chunk), bit);
        self
    }

    /// The next `n` calls to `handle_events` are interrupted
    pub fn interrupt(mut self, n: usize) -> Self {
        self.interrupts = n;
        self
    }

    /// `handle_events` call number `n` (counting from 0) fails with `error`; completions stay
    /// queued for the next call
    pub fn fail_poll(mut self, n: usize, error: rusb::Error) -> Self {
        self.poll_fault = Some((n, error));
        self
    }

    /// Requests cancellation once `n` completions have been handed back
    pub fn cancel_after(mut self, n: usize, token: CancellationToken) -> Self {
        self.trip = Some((n, token));
        self
    }

    /// Completions handed back so far, as `(direction, chunk)`
    pub fn delivered(&self) -> &[(Direction, usize)] {
        &self.delivered
    }

    /// Transfers submitted so far
    pub fn submissions(&self) -> usize {
        self.seq
    }

    // the device processes everything the host controller has queued
    fn execute(&mut self) {
        while let Some(mut entry) = self.pending.pop_front() {
            let key = (entry.transfer.direction(), entry.transfer.chunk());

            if let Some(error) = self.faults.remove(&key) {
                entry.transfer.complete(Status::Error(error), 0);
                self.ready.push(entry);
                continue;
            }

            match key.0 {
                Direction::Out => {
                    let len = entry.transfer.len();
                    if self.mode == Mode::Loopback {
                        let mut echo = ledger::invert(entry.transfer.buffer_mut());
                        if let Some(bit) = self.corruptions.remove(&key) {
                            flip(&mut echo, bit);
                        }
                        self.fifo.push_back(echo);
                    }
                    entry.transfer.complete(Status::Completed, len);
                    self.ready.push(entry);
                }

                Direction::In => self.parked.push_back(entry),
            }
        }

        while !self.parked.is_empty() {
            let data = match self.mode {
                Mode::InOnly => vec![SOURCE_BYTE; self.parked[0].transfer.len()],
                _ => match self.fifo.pop_front() {
                    Some(data) => data,
                    None => break,
                },
            };

            if let Some(mut entry) = self.parked.pop_front() {
                let key = (Direction::In, entry.transfer.chunk());
                let buffer = entry.transfer.buffer_mut();
                // the rest of a packet that doesn't fit is lost, as with a real overflow
                let n = cmp::min(buffer.len(), data.len());
                buffer[..n].copy_from_slice(&data[..n]);
                if let Some(bit) = self.corruptions.remove(&key) {
                    flip(&mut buffer[..n], bit);
                }
                entry.transfer.complete(Status::Completed, n);
                self.ready.push(entry);
            }
        }

        if self.ready.is_empty() {
            // nothing will ever feed these
            while let Some(mut entry) = self.parked.pop_front() {
                entry.transfer.complete(Status::Error(rusb::Error::Timeout), 0);
                self.ready.push(entry);
            }
        }
    }
}

fn flip(bytes: &mut [u8], bit: usize) {
    if let Some(byte) = bytes.get_mut(bit / 8) {
        *byte ^= 1 << (bit % 8);
    }
}

impl Transport for Device {
    fn submit(&mut self, transfer: Transfer) -> Result<Handle, rusb::Error> {
        let seq = self.seq;
        self.seq += 1;
        let handle = Handle(seq as u64);

        trace!(
            "sim: {} chunk {} submitted as {:?}",
            transfer.direction(),
            transfer.chunk(),
            handle
        );
        self.pending.push_back(Entry {
            handle,
            seq,
            transfer,
        });

        Ok(handle)
    }

    fn cancel(&mut self, handle: Handle) -> Result<(), rusb::Error> {
        for queue in [&mut self.pending, &mut self.parked].iter_mut() {
            if let Some(pos) = queue.iter().position(|entry| entry.handle == handle) {
                if let Some(mut entry) = queue.remove(pos) {
                    entry.transfer.complete(Status::Cancelled, 0);
                    self.ready.push(entry);
                    return Ok(());
                }
            }
        }

        Err(rusb::Error::NotFound)
    }

    fn handle_events(&mut self, completed: &mut Vec<Transfer>) -> Result<(), rusb::Error> {
        if self.interrupts != 0 {
            self.interrupts -= 1;
            return Err(rusb::Error::Interrupted);
        }

        let poll = self.polls;
        self.polls += 1;
        if let Some((n, error)) = self.poll_fault {
            if n == poll {
                self.poll_fault = None;
                return Err(error);
            }
        }

        self.execute();

        match &mut self.order {
            Order::Fifo => {}
            Order::Reverse => self.ready.sort_by_key(|entry| cmp::Reverse(entry.seq)),
            Order::Shuffle(_) => self.ready.shuffle(&mut self.rng),
            Order::ByKey(key) => self.ready.sort_by_key(|entry| key(&entry.transfer)),
        }

        let n = cmp::min(self.events_per_poll, self.ready.len());
        let rest = self.ready.split_off(n);
        for entry in mem::replace(&mut self.ready, rest) {
            self.delivered
                .push((entry.transfer.direction(), entry.transfer.chunk()));
            completed.push(entry.transfer);
        }

        if let Some((after, token)) = &self.trip {
            if self.delivered.len() >= *after {
                token.cancel();
            }
        }

        Ok(())
    }

    fn in_flight(&self) -> usize {
        self.pending.len() + self.parked.len() + self.ready.len()
    }
}

#[cfg(test)]
mod tests {
    use core::time::Duration;

    use crate::{
        ledger,
        transfer::{Direction, Status, Transfer, Transport as _},
        Mode,
    };

    use super::Device;

    const TIMEOUT: Duration = Duration::from_millis(10);

    #[test]
    fn inverts_and_echoes() {
        let mut device = Device::new(Mode::Loopback);
        device
            .submit(Transfer::outbound(0x01, vec![0x00, 0x0f], TIMEOUT, 0))
            .unwrap();
        device
            .submit(Transfer::inbound(0x81, 2, TIMEOUT, 0))
            .unwrap();

        let mut completed = vec![];
        device.handle_events(&mut completed).unwrap();
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[1].data(), &ledger::invert(&[0x00, 0x0f])[..]);
        assert_eq!(device.in_flight(), 0);
    }

    #[test]
    fn starved_in_times_out() {
        let mut device = Device::new(Mode::OutOnly);
        device
            .submit(Transfer::inbound(0x81, 8, TIMEOUT, 0))
            .unwrap();

        let mut completed = vec![];
        device.handle_events(&mut completed).unwrap();
        assert_eq!(completed[0].status(), Status::Error(rusb::Error::Timeout));
    }

    #[test]
    fn cancel_before_execution() {
        let mut device = Device::new(Mode::Loopback);
        let handle = device
            .submit(Transfer::inbound(0x81, 8, TIMEOUT, 0))
            .unwrap();

        device.cancel(handle).unwrap();
        assert_eq!(device.cancel(handle), Err(rusb::Error::NotFound));

        let mut completed = vec![];
        device.handle_events(&mut completed).unwrap();
        assert_eq!(completed[0].status(), Status::Cancelled);
        assert_eq!(device.delivered(), [(Direction::In, 0)]);
    }

    #[test]
    fn source_mode() {
        let mut device = Device::new(Mode::InOnly);
        device
            .submit(Transfer::inbound(0x81, 4, TIMEOUT, 0))
            .unwrap();

        let mut completed = vec![];
        device.handle_events(&mut completed).unwrap();
        assert_eq!(completed[0].data(), [0xa5; 4]);
    }
}
