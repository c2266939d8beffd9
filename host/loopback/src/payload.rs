//! Test payloads

use rand::{rngs::StdRng, RngCore as _, SeedableRng as _};

const AA5500FF: [u8; 4] = [0xaa, 0x55, 0x00, 0xff];

/// Contents of the payloads sent to the device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pattern {
    /// `aa 55 00 ff` repeated; every bit toggles somewhere in each word
    Aa5500ff,
    /// Fresh random bytes for every payload
    Random,
    /// Reproducible pseudo-random bytes
    Seeded(u64),
}

/// Produces one payload per batch
pub struct Payloads {
    rng: Option<StdRng>,
}

impl Payloads {
    /// Payload generator for `pattern`
    pub fn new(pattern: Pattern) -> Self {
        let rng = match pattern {
            Pattern::Aa5500ff => None,
            Pattern::Random => Some(StdRng::from_entropy()),
            Pattern::Seeded(seed) => Some(StdRng::seed_from_u64(seed)),
        };

        Self { rng }
    }

    /// Next `len`-byte payload
    pub fn next(&mut self, len: usize) -> Vec<u8> {
        match &mut self.rng {
            Some(rng) => {
                let mut bytes = vec![0; len];
                rng.fill_bytes(&mut bytes);
                bytes
            }
            None => AA5500FF.iter().copied().cycle().take(len).collect(),
        }
    }
}
