//! Event loop

use log::{debug, error, info, warn};

use crate::{
    scheduler::Batch,
    throughput::Throughput,
    transfer::{Transfer, Transport},
    CancellationToken, Error,
};

/// `handle_events` calls spent reaping an aborted batch after the event handling failed
const TEARDOWN_POLLS: usize = 64;

/// How a batch left the event loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Every chunk went through
    Drained,
    /// Cancellation was requested; the transfers in flight were drained or cancelled
    Cancelled,
}

/// Starts `batch` and drives it until it's drained
///
/// `Transport::handle_events` is the only place where this blocks. Cancellation is checked
/// between two calls to it. On a fatal error the remaining transfers are cancelled and reaped
/// before the error is returned, so the transport owns none of the batch's buffers afterwards.
/// If the event handling itself fails, the reaping is bounded to `TEARDOWN_POLLS` further
/// calls; whatever is left after that is the transport's to clean up when it's dropped
pub fn run_until_drained<T>(
    transport: &mut T,
    batch: &mut Batch,
    throughput: &mut Throughput,
    cancel: &CancellationToken,
) -> Result<Outcome, Error>
where
    T: Transport + ?Sized,
{
    let mut completed = vec![];
    let mut fatal = None;
    let mut cancelled = false;

    if cancel.is_cancelled() {
        cancelled = true;
        batch.stop(transport);
    } else if let Err(e) = batch.start(transport, throughput) {
        error!("{}; cancelling {} outstanding transfer(s)", e, batch.outstanding());
        batch.abort(transport);
        fatal = Some(e);
    }

    while !batch.is_drained() {
        if !cancelled && cancel.is_cancelled() {
            info!(
                "cancellation requested; {} transfer(s) still outstanding",
                batch.outstanding()
            );
            cancelled = true;
            batch.stop(transport);
        }

        match transport.handle_events(&mut completed) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("event handling interrupted; retrying");
            }
            Err(e) => {
                error!(
                    "event handling failed with {} transfer(s) outstanding",
                    batch.outstanding()
                );
                batch.abort(transport);
                reap(transport, batch, throughput, &mut completed);
                return Err(Error::Events(e));
            }
        }

        for transfer in completed.drain(..) {
            if let Err(e) = batch.advance(transport, throughput, transfer) {
                if fatal.is_none() {
                    error!("{}; cancelling {} outstanding transfer(s)", e, batch.outstanding());
                    batch.abort(transport);
                    fatal = Some(e);
                } else {
                    debug!("ignoring error while aborting: {}", e);
                }
            }
        }
    }

    if let Some(e) = fatal {
        return Err(e);
    }

    if cancelled {
        Ok(Outcome::Cancelled)
    } else {
        throughput.record_batch();
        Ok(Outcome::Drained)
    }
}

// Hands the transfers of an aborted batch back to it
fn reap<T>(
    transport: &mut T,
    batch: &mut Batch,
    throughput: &mut Throughput,
    completed: &mut Vec<Transfer>,
) where
    T: Transport + ?Sized,
{
    for _ in 0..TEARDOWN_POLLS {
        for transfer in completed.drain(..) {
            if let Err(e) = batch.advance(transport, throughput, transfer) {
                debug!("ignoring error while aborting: {}", e);
            }
        }

        if batch.is_drained() {
            return;
        }

        if let Err(e) = transport.handle_events(completed) {
            debug!("event handling failed while aborting: {}", e);
        }
    }

    if !batch.is_drained() {
        warn!(
            "{} transfer(s) of batch {} are still owned by the transport",
            batch.outstanding(),
            batch.index()
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        scheduler::{Batch, State},
        sim::{Device, Order},
        throughput::Throughput,
        transfer::{Direction, Status, Transport as _},
        CancelPolicy, CancellationToken, Config, Error, Mode, Pattern, Payloads,
        VerificationError,
    };

    use super::{run_until_drained, Outcome};

    fn config(chunk_size: usize) -> Config {
        Config {
            chunk_size,
            pattern: Pattern::Seeded(2232),
            ..Config::default()
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        Payloads::new(Pattern::Seeded(2232)).next(len)
    }

    fn drive(
        device: &mut Device,
        config: &Config,
        len: usize,
    ) -> (Result<Outcome, Error>, Batch, Throughput) {
        let mut batch = Batch::new(0, payload(len), config).unwrap();
        let mut throughput = Throughput::new();
        let result = run_until_drained(
            device,
            &mut batch,
            &mut throughput,
            &CancellationToken::new(),
        );
        (result, batch, throughput)
    }

    #[test]
    fn four_chunks() {
        let mut device = Device::new(Mode::Loopback);
        let (result, batch, throughput) = drive(&mut device, &config(64), 256);

        assert_eq!(result.unwrap(), Outcome::Drained);
        assert_eq!(batch.state(), State::Drained);

        let transfers = batch.transfers();
        assert_eq!(transfers.len(), 8);
        assert_eq!(
            transfers.iter().filter(|t| t.1 == Direction::Out).count(),
            4
        );
        assert!(transfers.iter().all(|t| t.2 == Status::Completed));

        assert_eq!(throughput.bytes(), 256);
        assert_eq!(throughput.finish(false).batches, 1);
        assert!(throughput.report(throughput.elapsed()) > 0.);
        assert_eq!(device.in_flight(), 0);
    }

    #[test]
    fn echoes_completing_out_of_order() {
        // deliver one event per poll; among the echoes prefer chunk 2, then 0, then 1
        let rank = |chunk: usize| match chunk {
            2 => 1,
            0 => 2,
            _ => 3,
        };
        let mut device = Device::new(Mode::Loopback)
            .events_per_poll(1)
            .order(Order::ByKey(Box::new(move |t| match t.direction() {
                Direction::Out => 0,
                Direction::In => rank(t.chunk()),
            })));

        let (result, _, throughput) = drive(&mut device, &config(64), 192);

        assert_eq!(result.unwrap(), Outcome::Drained);
        assert_eq!(throughput.bytes(), 192);
        let echoes = device
            .delivered()
            .iter()
            .filter(|(dir, _)| *dir == Direction::In)
            .map(|(_, chunk)| *chunk)
            .collect::<Vec<_>>();
        assert_eq!(echoes, [2, 0, 1]);
    }

    #[test]
    fn same_outcome_under_any_interleaving() {
        let orders = || {
            vec![
                Order::Fifo,
                Order::Reverse,
                Order::Shuffle(1),
                Order::Shuffle(2),
                Order::Shuffle(3),
            ]
        };

        for order in orders() {
            let mut device = Device::new(Mode::Loopback).events_per_poll(2).order(order);
            let (result, _, throughput) = drive(&mut device, &config(16), 512);
            assert_eq!(result.unwrap(), Outcome::Drained);
            assert_eq!(throughput.bytes(), 512);
        }

        for order in orders() {
            let mut device = Device::new(Mode::Loopback)
                .events_per_poll(2)
                .order(order)
                .corrupt(Direction::In, 5, 0);
            match drive(&mut device, &config(16), 512).0 {
                Err(Error::Mismatch { chunk: 5, .. }) => {}
                other => panic!("unexpected result: {:?}", other),
            }
            assert_eq!(device.in_flight(), 0);
        }
    }

    #[test]
    fn flipped_bit_is_fatal() {
        let mut device = Device::new(Mode::Loopback).corrupt(Direction::In, 1, 7);
        let (result, batch, _) = drive(&mut device, &config(64), 256);

        match result {
            Err(Error::Mismatch {
                batch: 0,
                chunk: 1,
                source: VerificationError::Corrupt { offset: 0, .. },
            }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(batch.outstanding(), 0);
        assert_eq!(device.in_flight(), 0);
    }

    #[test]
    fn stall_is_fatal() {
        let mut device = Device::new(Mode::Loopback).fail(Direction::Out, 2, rusb::Error::Pipe);
        let (result, _, _) = drive(&mut device, &config(64), 256);

        match result {
            Err(Error::Fault {
                chunk: 2,
                direction: Direction::Out,
                endpoint: 0x01,
                source: rusb::Error::Pipe,
                ..
            }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(device.in_flight(), 0);
    }

    #[test]
    fn timeout_fails_only_the_chunk() {
        let mut device =
            Device::new(Mode::Loopback).fail(Direction::Out, 1, rusb::Error::Timeout);
        let (result, batch, throughput) = drive(&mut device, &config(64), 256);

        assert_eq!(result.unwrap(), Outcome::Drained);
        assert_eq!(throughput.bytes(), 192);
        assert_eq!(throughput.timeouts(), 1);
        // no echo was requested for the failed chunk
        assert_eq!(batch.transfers().len(), 7);
        assert!(batch
            .transfers()
            .contains(&(1, Direction::Out, Status::Error(rusb::Error::Timeout))));
    }

    #[test]
    fn timed_out_echo_is_read_again() {
        // the echo of chunk 1 stays queued on the device and ends up in a later IN transfer
        let mut device = Device::new(Mode::Loopback).fail(Direction::In, 1, rusb::Error::Timeout);
        let (result, batch, throughput) = drive(&mut device, &config(64), 256);

        assert_eq!(result.unwrap(), Outcome::Drained);
        assert_eq!(throughput.bytes(), 256);
        assert_eq!(throughput.timeouts(), 1);
        // 4 OUT + 4 IN + 1 resubmitted IN
        assert_eq!(device.submissions(), 9);
        assert!(batch.transfers().iter().all(|t| t.2 == Status::Completed));
        assert_eq!(device.in_flight(), 0);
    }

    #[test]
    fn timed_out_echo_under_any_interleaving() {
        for &seed in [1, 2, 3, 4].iter() {
            let mut device = Device::new(Mode::Loopback)
                .events_per_poll(2)
                .order(Order::Shuffle(seed))
                .fail(Direction::In, 5, rusb::Error::Timeout);
            let (result, _, throughput) = drive(&mut device, &config(16), 512);

            assert_eq!(result.unwrap(), Outcome::Drained, "seed {}", seed);
            assert_eq!(throughput.bytes(), 512);
            assert_eq!(throughput.timeouts(), 1);
        }
    }

    #[test]
    fn failed_event_handling_reaps_the_batch() {
        // OUTs complete on the first poll; the second one fails with the echoes in flight
        let mut device = Device::new(Mode::Loopback).fail_poll(1, rusb::Error::Io);
        let (result, batch, throughput) = drive(&mut device, &config(64), 256);

        match result {
            Err(Error::Events(rusb::Error::Io)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(batch.outstanding(), 0);
        assert_eq!(device.in_flight(), 0);
        assert!(batch
            .transfers()
            .contains(&(3, Direction::In, Status::Cancelled)));
        assert_eq!(throughput.bytes(), 0);
    }

    #[test]
    fn interrupted_polls_are_retried() {
        let mut device = Device::new(Mode::Loopback).interrupt(3);
        let (result, _, throughput) = drive(&mut device, &config(64), 128);

        assert_eq!(result.unwrap(), Outcome::Drained);
        assert_eq!(throughput.bytes(), 128);
    }

    #[test]
    fn cancellation_drains_pairs_in_flight() {
        let cancel = CancellationToken::new();
        // OUT 0..3 and the echoes of chunks 0 and 1 -> 2 of 4 pairs outstanding
        let mut device = Device::new(Mode::Loopback)
            .events_per_poll(1)
            .cancel_after(6, cancel.clone());
        let mut batch = Batch::new(0, payload(256), &config(64)).unwrap();
        let mut throughput = Throughput::new();

        let outcome = run_until_drained(&mut device, &mut batch, &mut throughput, &cancel).unwrap();

        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(throughput.bytes(), 256);
        // every pair went through, but the batch was cut short
        assert_eq!(throughput.finish(true).batches, 0);
        assert_eq!(batch.outstanding(), 0);
        assert_eq!(device.in_flight(), 0);
    }

    #[test]
    fn cancellation_aborts_pairs_in_flight() {
        let cancel = CancellationToken::new();
        let config = Config {
            cancel_policy: CancelPolicy::Abort,
            ..config(64)
        };
        // OUT 0 and OUT 1 seen; echo 0 queued on the device, echo 1 not yet started
        let mut device = Device::new(Mode::Loopback)
            .events_per_poll(1)
            .cancel_after(2, cancel.clone());
        let mut batch = Batch::new(0, payload(256), &config).unwrap();
        let mut throughput = Throughput::new();

        let outcome = run_until_drained(&mut device, &mut batch, &mut throughput, &cancel).unwrap();

        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(throughput.bytes(), 64);
        assert_eq!(throughput.finish(true).batches, 0);
        assert!(batch
            .transfers()
            .contains(&(1, Direction::In, Status::Cancelled)));
        assert_eq!(batch.outstanding(), 0);
        assert_eq!(device.in_flight(), 0);
    }

    #[test]
    fn cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut device = Device::new(Mode::Loopback);
        let mut batch = Batch::new(0, payload(256), &config(64)).unwrap();
        let mut throughput = Throughput::new();

        let outcome = run_until_drained(&mut device, &mut batch, &mut throughput, &cancel).unwrap();

        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(device.submissions(), 0);
    }
}
