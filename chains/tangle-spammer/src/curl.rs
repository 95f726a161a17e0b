//! Curl-P-81 sponge.

pub const HASH_LENGTH: usize = 243;
pub const STATE_LENGTH: usize = HASH_LENGTH * 3;
pub const NUMBER_OF_ROUNDS: usize = 81;

const TRUTH_TABLE: [i8; 11] = [1, 0, -1, 2, 1, -1, 0, 2, -1, 1, 0];

#[derive(Clone)]
pub struct Curl {
    state: [i8; STATE_LENGTH],
}

impl Default for Curl {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Curl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Curl").finish_non_exhaustive()
    }
}

impl Curl {
    pub fn new() -> Self {
        Self {
            state: [0; STATE_LENGTH],
        }
    }

    pub fn reset(&mut self) {
        self.state = [0; STATE_LENGTH];
    }

    /// Absorbs trits in 243-trit blocks. A short final block only overwrites
    /// the head of the rate.
    pub fn absorb(&mut self, trits: &[i8]) {
        for chunk in trits.chunks(HASH_LENGTH) {
            self.state[..chunk.len()].copy_from_slice(chunk);
            self.transform();
        }
    }

    /// Squeezes `out.len()` trits, one 243-trit block per transform.
    pub fn squeeze(&mut self, out: &mut [i8]) {
        for chunk in out.chunks_mut(HASH_LENGTH) {
            chunk.copy_from_slice(&self.state[..chunk.len()]);
            self.transform();
        }
    }

    pub fn digest(trits: &[i8]) -> [i8; HASH_LENGTH] {
        let mut curl = Curl::new();
        curl.absorb(trits);
        let mut hash = [0i8; HASH_LENGTH];
        curl.squeeze(&mut hash);
        hash
    }

    /// The rate part of the state, i.e. what the next squeeze would return.
    pub fn rate(&self) -> &[i8] {
        &self.state[..HASH_LENGTH]
    }

    fn transform(&mut self) {
        let mut scratch = [0i8; STATE_LENGTH];
        let mut index = 0usize;

        for _ in 0..NUMBER_OF_ROUNDS {
            scratch.copy_from_slice(&self.state);
            for slot in self.state.iter_mut() {
                let prev = index;
                index = if index < 365 { index + 364 } else { index - 365 };
                let lookup = scratch[prev] as i32 + ((scratch[index] as i32) << 2) + 5;
                *slot = TRUTH_TABLE[lookup as usize];
            }
        }
    }
}
