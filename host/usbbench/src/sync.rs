//! One packet at a time, with blocking transfers

use core::cmp;

use log::warn;
use loopback::{
    check_echo, CancellationToken, Config, Direction, Error, Mode, Payloads, Throughput,
    ThroughputReport, VerificationError,
};
use rusb::{Context, DeviceHandle};

/// Consecutive reads of an echo that timed out before the chunk is given up
const MAX_ECHO_RETRIES: usize = 3;

/// Blocking counterpart of `loopback::run_with_progress`
///
/// Each chunk is written and (in loopback mode) read back before the next one is sent. Timeouts
/// fail only their chunk and are counted; a timed-out echo is read again up to
/// `MAX_ECHO_RETRIES` times
pub fn run<F>(
    handle: &DeviceHandle<Context>,
    config: &Config,
    cancel: &CancellationToken,
    mut progress: F,
) -> Result<ThroughputReport, Error>
where
    F: FnMut(&Throughput),
{
    config.validate()?;

    let mut throughput = Throughput::new();
    let mut payloads = Payloads::new(config.pattern);
    let mut remaining = config.total_bytes;
    let mut rx = vec![0; config.chunk_size];
    let mut batch = 0;

    let cancelled = loop {
        if cancel.is_cancelled() {
            break true;
        }

        let len = match remaining {
            Some(0) => break false,
            Some(n) => cmp::min(n, config.batch_size as u64) as usize,
            None => config.batch_size,
        };

        throughput.start();
        let payload = payloads.next(len);
        let mut cut_short = false;
        for (chunk, tx) in payload.chunks(config.chunk_size).enumerate() {
            if cancel.is_cancelled() {
                cut_short = true;
                break;
            }

            let fault = |direction, endpoint, source| Error::Fault {
                batch,
                chunk,
                direction,
                endpoint,
                source,
            };
            let mismatch = |source| Error::Mismatch {
                batch,
                chunk,
                source,
            };

            if config.mode != Mode::InOnly {
                match handle.write_bulk(config.out_endpoint, tx, config.timeout) {
                    Ok(n) if n == tx.len() => {}
                    Ok(n) => {
                        return Err(mismatch(VerificationError::Length {
                            expected: tx.len(),
                            received: n,
                        }))
                    }
                    Err(rusb::Error::Timeout) => {
                        timed_out(&mut throughput, Direction::Out, batch, chunk);
                        continue;
                    }
                    Err(e) => return Err(fault(Direction::Out, config.out_endpoint, e)),
                }

                if config.mode == Mode::OutOnly {
                    throughput.record_bytes(tx.len());
                    continue;
                }
            }

            // a timed-out echo stays queued on the device; read it again before moving on
            let mut retries = 0;
            let n = loop {
                match handle.read_bulk(config.in_endpoint, &mut rx, config.timeout) {
                    Ok(n) => break Some(n),
                    Err(rusb::Error::Timeout) => {
                        timed_out(&mut throughput, Direction::In, batch, chunk);
                        if config.mode == Mode::Loopback && retries < MAX_ECHO_RETRIES {
                            retries += 1;
                            continue;
                        }
                        break None;
                    }
                    Err(e) => return Err(fault(Direction::In, config.in_endpoint, e)),
                }
            };
            let n = match n {
                Some(n) => n,
                None => continue,
            };

            if config.verify {
                if config.mode == Mode::Loopback {
                    check_echo(tx, &rx[..n]).map_err(mismatch)?;
                } else if n != rx.len() {
                    return Err(mismatch(VerificationError::Length {
                        expected: rx.len(),
                        received: n,
                    }));
                }
            }
            throughput.record_bytes(n);
        }

        if !cut_short {
            throughput.record_batch();
        }
        progress(&throughput);

        if let Some(remaining) = remaining.as_mut() {
            *remaining -= len as u64;
        }
        batch += 1;

        if len == 0 {
            break false;
        }
    };

    Ok(throughput.finish(cancelled))
}

fn timed_out(throughput: &mut Throughput, direction: Direction, batch: u64, chunk: usize) {
    warn!(
        "batch {}: {} transfer of chunk {} timed out",
        batch, direction, chunk
    );
    throughput.record_timeout();
}
