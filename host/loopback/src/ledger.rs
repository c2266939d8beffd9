//! Chunks awaiting verification against their inverted echo

use std::collections::BTreeMap;

/// The echo of a chunk is not the bitwise inversion of what was sent
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    /// Nothing was recorded for this chunk, or its entry was already consumed
    #[error("no pending entry for chunk {chunk}")]
    Unrecorded { chunk: usize },

    #[error("expected {expected} bytes but received {received}")]
    Length { expected: usize, received: usize },

    #[error("byte {offset} is {received:#04x} but {expected:#04x} was expected (received: {dump})")]
    Corrupt {
        offset: usize,
        expected: u8,
        received: u8,
        dump: String,
    },
}

/// Bytes sent on OUT transfers whose IN echo has not been checked yet, keyed by chunk index
///
/// Entries are bound to a chunk when they are recorded, so the order in which the echoes come
/// back does not matter
#[derive(Debug, Default)]
pub struct Ledger {
    pending: BTreeMap<usize, Vec<u8>>,
}

impl Ledger {
    /// Creates an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the bytes of `chunk` until its echo arrives
    ///
    /// # Panics
    ///
    /// This function panics if `chunk` already has a pending entry
    pub fn record(&mut self, chunk: usize, bytes: Vec<u8>) {
        let previous = self.pending.insert(chunk, bytes);
        assert!(previous.is_none(), "chunk {} recorded twice", chunk);
    }

    /// Consumes the entry of `chunk` and checks `received` against it
    ///
    /// On success returns the number of verified bytes
    pub fn verify(&mut self, chunk: usize, received: &[u8]) -> Result<usize, VerificationError> {
        let sent = self
            .pending
            .remove(&chunk)
            .ok_or(VerificationError::Unrecorded { chunk })?;
        check_echo(&sent, received)?;
        Ok(sent.len())
    }

    /// Drops the entry of a chunk whose transfers failed; returns whether there was one
    pub fn discard(&mut self, chunk: usize) -> bool {
        self.pending.remove(&chunk).is_some()
    }

    /// Number of entries awaiting verification
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no entry is awaiting verification
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// What the device sends back for `bytes`
pub fn invert(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(|byte| byte ^ 0xff).collect()
}

/// Checks that `received` is `sent` with every bit flipped
pub fn check_echo(sent: &[u8], received: &[u8]) -> Result<(), VerificationError> {
    if sent.len() != received.len() {
        return Err(VerificationError::Length {
            expected: sent.len(),
            received: received.len(),
        });
    }

    if let Some(offset) = sent
        .iter()
        .zip(received)
        .position(|(sent, received)| sent ^ 0xff != *received)
    {
        return Err(VerificationError::Corrupt {
            offset,
            expected: sent[offset] ^ 0xff,
            received: received[offset],
            dump: hex::encode(received),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{invert, Ledger, VerificationError};

    #[test]
    fn verifies_inverted_echo() {
        let mut ledger = Ledger::new();
        ledger.record(0, vec![0xaa, 0x55, 0x00, 0xff]);

        assert_eq!(ledger.verify(0, &[0x55, 0xaa, 0xff, 0x00]), Ok(4));
        assert!(ledger.is_empty());
    }

    #[test]
    fn entries_are_consumed_once() {
        let mut ledger = Ledger::new();
        ledger.record(7, vec![1, 2, 3]);
        let echo = invert(&[1, 2, 3]);

        assert_eq!(ledger.verify(7, &echo), Ok(3));
        assert_eq!(
            ledger.verify(7, &echo),
            Err(VerificationError::Unrecorded { chunk: 7 })
        );
    }

    #[test]
    fn out_of_order_echoes() {
        let chunks = [vec![0x00; 4], vec![0x0f; 4], vec![0xf0; 4]];

        let mut ledger = Ledger::new();
        for (i, chunk) in chunks.iter().enumerate() {
            ledger.record(i, chunk.clone());
        }

        for &i in &[2, 0, 1] {
            assert_eq!(ledger.verify(i, &invert(&chunks[i])), Ok(4));
        }
        assert!(ledger.is_empty());
    }

    #[test]
    fn single_bit_flip() {
        let sent = (0..64).collect::<Vec<u8>>();
        let mut echo = invert(&sent);
        echo[42] ^= 0b1000;

        let mut ledger = Ledger::new();
        ledger.record(1, sent);
        match ledger.verify(1, &echo) {
            Err(VerificationError::Corrupt {
                offset,
                expected,
                received,
                ..
            }) => {
                assert_eq!(offset, 42);
                assert_eq!(expected, 42 ^ 0xff);
                assert_eq!(received, (42 ^ 0xff) ^ 0b1000);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        // the entry is gone even though verification failed
        assert!(ledger.is_empty());
    }

    #[test]
    fn short_echo() {
        let mut ledger = Ledger::new();
        ledger.record(0, vec![0; 64]);

        assert_eq!(
            ledger.verify(0, &[0xff; 32]),
            Err(VerificationError::Length {
                expected: 64,
                received: 32
            })
        );
    }

    #[test]
    fn discard() {
        let mut ledger = Ledger::new();
        ledger.record(0, vec![0; 4]);

        assert!(ledger.discard(0));
        assert!(!ledger.discard(0));
        assert_eq!(ledger.len(), 0);
    }

    #[test]
    #[should_panic(expected = "recorded twice")]
    fn double_record() {
        let mut ledger = Ledger::new();
        ledger.record(0, vec![0; 4]);
        ledger.record(0, vec![0; 4]);
    }
}
