//! Proof-of-work: nonce search and bundle sealing.
//!
//! A [`PowFn`] finds a nonce such that the Curl hash of the transaction ends
//! in at least `mwm` zero trits. Two local implementations are provided, a
//! single-threaded search and one that splits the nonce space across threads.
//! They are registered by name so a controller can switch between them.

use chrono::Utc;
use core_logic::{ConfigError, PowError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;

use crate::curl::{Curl, HASH_LENGTH};
use crate::ternary::{trits_to_trytes, trytes_to_trits, TRITS_PER_TRYTE};
use crate::transaction::{Transaction, NONCE_TRYTES, TRANSACTION_TRYTES};

pub const MAX_MWM: u32 = HASH_LENGTH as u32;

/// Encodes to `L99999999`.
pub const ATTACHMENT_TIMESTAMP_UPPER_BOUND: i64 = 12;

const TRANSACTION_TRITS: usize = TRANSACTION_TRYTES * TRITS_PER_TRYTE;
const NONCE_TRITS: usize = NONCE_TRYTES * TRITS_PER_TRYTE;
const PREFIX_TRITS: usize = TRANSACTION_TRITS - HASH_LENGTH;
const NONCE_OFFSET: usize = HASH_LENGTH - NONCE_TRITS;
/// Leading nonce trits fixed per thread by the parallel search.
const PARTITION_TRITS: usize = 5;

/// A named nonce search.
pub trait PowFn: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the 27-tryte nonce for `trytes` (a full transaction).
    fn search(&self, trytes: &str, mwm: u32) -> Result<String, PowError>;
}

/// Serializes local nonce searches across every spammer in the process.
pub fn pow_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

struct SearchInput {
    prefix: Curl,
    last_block: Vec<i8>,
}

fn prepare(trytes: &str, mwm: u32) -> Result<SearchInput, PowError> {
    if trytes.len() != TRANSACTION_TRYTES {
        return Err(PowError::InvalidLength {
            expected: TRANSACTION_TRYTES,
            actual: trytes.len(),
        });
    }
    if mwm == 0 || mwm > MAX_MWM {
        return Err(PowError::InvalidMwm { mwm, max: MAX_MWM });
    }
    let trits = trytes_to_trits(trytes).ok_or(PowError::InvalidTrytes)?;

    let mut prefix = Curl::new();
    prefix.absorb(&trits[..PREFIX_TRITS]);
    Ok(SearchInput {
        prefix,
        last_block: trits[PREFIX_TRITS..].to_vec(),
    })
}

fn meets_mwm(hash: &[i8], mwm: u32) -> bool {
    hash[HASH_LENGTH - mwm as usize..].iter().all(|&t| t == 0)
}

/// Balanced-ternary increment. Returns false once the counter wraps.
fn increment(trits: &mut [i8]) -> bool {
    for trit in trits.iter_mut() {
        if *trit == 1 {
            *trit = -1;
        } else {
            *trit += 1;
            return true;
        }
    }
    false
}

/// Walks the nonce space from `start`, only touching trits at `free_from..`.
fn search_range(
    input: &SearchInput,
    mwm: u32,
    start: &[i8],
    free_from: usize,
    found: &AtomicBool,
) -> Option<Vec<i8>> {
    let mut block = input.last_block.clone();
    block[NONCE_OFFSET..].copy_from_slice(start);

    loop {
        if found.load(Ordering::Relaxed) {
            return None;
        }
        let mut curl = input.prefix.clone();
        curl.absorb(&block);
        if meets_mwm(curl.rate(), mwm) {
            found.store(true, Ordering::Relaxed);
            return Some(block[NONCE_OFFSET..].to_vec());
        }
        if !increment(&mut block[NONCE_OFFSET + free_from..]) {
            return None;
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PowCurl;

impl PowFn for PowCurl {
    fn name(&self) -> &'static str {
        "Curl"
    }

    fn search(&self, trytes: &str, mwm: u32) -> Result<String, PowError> {
        let input = prepare(trytes, mwm)?;
        let start = vec![-1i8; NONCE_TRITS];
        search_range(&input, mwm, &start, 0, &AtomicBool::new(false))
            .map(|nonce| trits_to_trytes(&nonce))
            .ok_or(PowError::Exhausted { mwm })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PowCurlParallel {
    threads: usize,
}

impl PowCurlParallel {
    pub fn new(threads: usize) -> Self {
        // 3^5 partitions available
        Self {
            threads: threads.clamp(1, 243),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }
}

impl Default for PowCurlParallel {
    fn default() -> Self {
        Self::new(available_threads())
    }
}

impl PowFn for PowCurlParallel {
    fn name(&self) -> &'static str {
        "CurlParallel"
    }

    fn search(&self, trytes: &str, mwm: u32) -> Result<String, PowError> {
        let input = prepare(trytes, mwm)?;
        let found = AtomicBool::new(false);

        let results: Vec<std::thread::Result<Option<Vec<i8>>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..self.threads)
                .map(|partition| {
                    let input = &input;
                    let found = &found;
                    scope.spawn(move || {
                        let mut start = vec![-1i8; NONCE_TRITS];
                        for _ in 0..partition {
                            increment(&mut start[..PARTITION_TRITS]);
                        }
                        search_range(input, mwm, &start, PARTITION_TRITS, found)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join()).collect()
        });

        let mut nonce = None;
        for result in results {
            match result {
                Ok(Some(trits)) if nonce.is_none() => nonce = Some(trits),
                Ok(_) => {}
                Err(_) => {
                    return Err(PowError::Aborted {
                        reason: "search thread panicked".to_string(),
                    })
                }
            }
        }
        nonce
            .map(|trits| trits_to_trytes(&trits))
            .ok_or(PowError::Exhausted { mwm })
    }
}

fn available_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Names accepted by [`pow_by_name`].
pub fn available_pow_types() -> Vec<&'static str> {
    vec![PowCurl.name(), PowCurlParallel::new(1).name()]
}

pub fn pow_by_name(name: &str) -> Result<Arc<dyn PowFn>, ConfigError> {
    if name.eq_ignore_ascii_case(PowCurl.name()) {
        Ok(Arc::new(PowCurl))
    } else if name.eq_ignore_ascii_case(PowCurlParallel::new(1).name()) {
        Ok(Arc::new(PowCurlParallel::default()))
    } else {
        Err(ConfigError::UnknownPow {
            name: name.to_string(),
            available: available_pow_types().join(", "),
        })
    }
}

/// The fastest search for this machine.
pub fn best_pow() -> Arc<dyn PowFn> {
    if available_threads() > 1 {
        Arc::new(PowCurlParallel::default())
    } else {
        Arc::new(PowCurl)
    }
}

/// Chains and seals a prepared bundle onto a tip pair.
///
/// Walks from the last transaction to the first: the last one approves the
/// tips directly, every earlier one approves its successor (trunk) and the tip
/// trunk (branch). Any failed search fails the whole bundle.
pub fn seal_bundle(
    trunk: &str,
    branch: &str,
    mut transactions: Vec<Transaction>,
    mwm: u32,
    pow: &dyn PowFn,
) -> Result<Vec<Transaction>, PowError> {
    if transactions.is_empty() {
        return Err(PowError::Aborted {
            reason: "empty bundle".to_string(),
        });
    }

    let last = transactions.len() - 1;
    let mut prev = String::new();
    for i in (0..=last).rev() {
        let tx = &mut transactions[i];
        if i == last {
            tx.trunk_transaction = trunk.to_string();
            tx.branch_transaction = branch.to_string();
        } else {
            tx.trunk_transaction = std::mem::take(&mut prev);
            tx.branch_transaction = trunk.to_string();
        }

        tx.attachment_timestamp = Utc::now().timestamp_millis();
        tx.attachment_timestamp_lower_bound = 0;
        tx.attachment_timestamp_upper_bound = ATTACHMENT_TIMESTAMP_UPPER_BOUND;
        tx.nonce = pow.search(&tx.to_trytes(), mwm)?;

        prev = tx.hash();
    }

    Ok(transactions)
}
