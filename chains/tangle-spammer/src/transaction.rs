//! 2673-tryte transaction layout.

use anyhow::{bail, Context, Result};
use core_logic::StoredTransaction;

use crate::curl::Curl;
use crate::ternary::{int_to_trytes, is_trytes, trits_to_trytes, trytes_to_int, trytes_to_trits};

pub const TRANSACTION_TRYTES: usize = 2673;
pub const HASH_TRYTES: usize = 81;
pub const SIGNATURE_TRYTES: usize = 2187;
pub const NONCE_TRYTES: usize = 27;

/// Hash of the all-nines transaction, used as the null hash.
pub const NULL_HASH: &str =
    "999999999999999999999999999999999999999999999999999999999999999999999999999999999";

// Field boundaries in trytes.
const SIGNATURE: (usize, usize) = (0, 2187);
const ADDRESS: (usize, usize) = (2187, 2268);
const VALUE: (usize, usize) = (2268, 2295);
const OBSOLETE_TAG: (usize, usize) = (2295, 2322);
const TIMESTAMP: (usize, usize) = (2322, 2331);
const CURRENT_INDEX: (usize, usize) = (2331, 2340);
const LAST_INDEX: (usize, usize) = (2340, 2349);
const BUNDLE: (usize, usize) = (2349, 2430);
const TRUNK: (usize, usize) = (2430, 2511);
const BRANCH: (usize, usize) = (2511, 2592);
const TAG: (usize, usize) = (2592, 2619);
const ATTACHMENT_TIMESTAMP: (usize, usize) = (2619, 2628);
const ATTACHMENT_LOWER: (usize, usize) = (2628, 2637);
const ATTACHMENT_UPPER: (usize, usize) = (2637, 2646);
const NONCE: (usize, usize) = (2646, 2673);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub signature_message_fragment: String,
    pub address: String,
    pub value: i64,
    pub obsolete_tag: String,
    /// Seconds since the epoch.
    pub timestamp: i64,
    pub current_index: i64,
    pub last_index: i64,
    pub bundle: String,
    pub trunk_transaction: String,
    pub branch_transaction: String,
    pub tag: String,
    /// Milliseconds since the epoch.
    pub attachment_timestamp: i64,
    pub attachment_timestamp_lower_bound: i64,
    pub attachment_timestamp_upper_bound: i64,
    pub nonce: String,
}

impl Default for Transaction {
    fn default() -> Self {
        Self {
            signature_message_fragment: "9".repeat(SIGNATURE_TRYTES),
            address: NULL_HASH.to_string(),
            value: 0,
            obsolete_tag: "9".repeat(27),
            timestamp: 0,
            current_index: 0,
            last_index: 0,
            bundle: NULL_HASH.to_string(),
            trunk_transaction: NULL_HASH.to_string(),
            branch_transaction: NULL_HASH.to_string(),
            tag: "9".repeat(27),
            attachment_timestamp: 0,
            attachment_timestamp_lower_bound: 0,
            attachment_timestamp_upper_bound: 0,
            nonce: "9".repeat(NONCE_TRYTES),
        }
    }
}

fn field(trytes: &str, (start, end): (usize, usize)) -> &str {
    &trytes[start..end]
}

fn int_field(trytes: &str, bounds: (usize, usize), name: &str) -> Result<i64> {
    trytes_to_int(field(trytes, bounds)).with_context(|| format!("Invalid {} field", name))
}

impl Transaction {
    pub fn from_trytes(trytes: &str) -> Result<Self> {
        if trytes.len() != TRANSACTION_TRYTES {
            bail!(
                "Transaction must be {} trytes, got {}",
                TRANSACTION_TRYTES,
                trytes.len()
            );
        }
        if !is_trytes(trytes) {
            bail!("Transaction contains characters outside the tryte alphabet");
        }

        Ok(Self {
            signature_message_fragment: field(trytes, SIGNATURE).to_string(),
            address: field(trytes, ADDRESS).to_string(),
            value: int_field(trytes, VALUE, "value")?,
            obsolete_tag: field(trytes, OBSOLETE_TAG).to_string(),
            timestamp: int_field(trytes, TIMESTAMP, "timestamp")?,
            current_index: int_field(trytes, CURRENT_INDEX, "current_index")?,
            last_index: int_field(trytes, LAST_INDEX, "last_index")?,
            bundle: field(trytes, BUNDLE).to_string(),
            trunk_transaction: field(trytes, TRUNK).to_string(),
            branch_transaction: field(trytes, BRANCH).to_string(),
            tag: field(trytes, TAG).to_string(),
            attachment_timestamp: int_field(trytes, ATTACHMENT_TIMESTAMP, "attachment_timestamp")?,
            attachment_timestamp_lower_bound: int_field(
                trytes,
                ATTACHMENT_LOWER,
                "attachment_timestamp_lower_bound",
            )?,
            attachment_timestamp_upper_bound: int_field(
                trytes,
                ATTACHMENT_UPPER,
                "attachment_timestamp_upper_bound",
            )?,
            nonce: field(trytes, NONCE).to_string(),
        })
    }

    pub fn to_trytes(&self) -> String {
        let mut out = String::with_capacity(TRANSACTION_TRYTES);
        out.push_str(&self.signature_message_fragment);
        out.push_str(&self.address);
        out.push_str(&int_to_trytes(self.value, 27));
        out.push_str(&self.obsolete_tag);
        out.push_str(&int_to_trytes(self.timestamp, 9));
        out.push_str(&int_to_trytes(self.current_index, 9));
        out.push_str(&int_to_trytes(self.last_index, 9));
        out.push_str(&self.bundle);
        out.push_str(&self.trunk_transaction);
        out.push_str(&self.branch_transaction);
        out.push_str(&self.tag);
        out.push_str(&int_to_trytes(self.attachment_timestamp, 9));
        out.push_str(&int_to_trytes(self.attachment_timestamp_lower_bound, 9));
        out.push_str(&int_to_trytes(self.attachment_timestamp_upper_bound, 9));
        out.push_str(&self.nonce);
        out
    }

    /// Curl-P-81 hash of the serialized transaction.
    pub fn hash(&self) -> String {
        hash_trytes(&self.to_trytes())
    }

    /// Trits hashed into the bundle hash: address, value, obsolete tag,
    /// timestamp and both indices.
    pub fn essence_trits(&self) -> Vec<i8> {
        let essence = format!(
            "{}{}{}{}{}{}",
            self.address,
            int_to_trytes(self.value, 27),
            self.obsolete_tag,
            int_to_trytes(self.timestamp, 9),
            int_to_trytes(self.current_index, 9),
            int_to_trytes(self.last_index, 9),
        );
        trytes_to_trits(&essence).unwrap_or_default()
    }

    pub fn to_stored(&self) -> StoredTransaction {
        let trytes = self.to_trytes();
        StoredTransaction {
            hash: hash_trytes(&trytes),
            trytes,
        }
    }
}

/// Hash of raw transaction trytes. Input is assumed to be valid trytes.
pub fn hash_trytes(trytes: &str) -> String {
    let trits = trytes_to_trits(trytes).unwrap_or_default();
    trits_to_trytes(&Curl::digest(&trits))
}
