//! Zero-value bundle construction.

use anyhow::{bail, Result};

use crate::curl::{Curl, HASH_LENGTH};
use crate::ternary::{is_trytes, pad_tag, pad_trytes, trits_to_trytes};
use crate::transaction::{Transaction, HASH_TRYTES, SIGNATURE_TRYTES};

/// One output of a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub address: String,
    pub value: i64,
    pub tag: String,
    /// Trytes; split across as many transactions as needed.
    pub message: String,
}

impl Transfer {
    pub fn zero_value(address: &str, tag: &str, message: &str) -> Self {
        Self {
            address: address.to_string(),
            value: 0,
            tag: tag.to_string(),
            message: message.to_string(),
        }
    }
}

/// Builds an unsealed bundle for zero-value transfers. `timestamp` is in
/// seconds. Trunk, branch, attachment fields and nonce are left for sealing.
pub fn prepare_zero_value_bundle(transfers: &[Transfer], timestamp: i64) -> Result<Vec<Transaction>> {
    if transfers.is_empty() {
        bail!("A bundle needs at least one transfer");
    }

    let mut bundle = Vec::new();
    for transfer in transfers {
        if transfer.value != 0 {
            bail!("Only zero-value transfers can be prepared without signing");
        }
        if transfer.address.len() != HASH_TRYTES || !is_trytes(&transfer.address) {
            bail!("Invalid transfer address '{}'", transfer.address);
        }
        if transfer.tag.len() > 27 || !is_trytes(&transfer.tag) {
            bail!("Invalid transfer tag '{}'", transfer.tag);
        }
        if !is_trytes(&transfer.message) {
            bail!("Transfer message is not valid trytes");
        }

        let tag = pad_tag(&transfer.tag);
        let fragments: Vec<String> = if transfer.message.is_empty() {
            vec![pad_trytes("", SIGNATURE_TRYTES)]
        } else {
            transfer
                .message
                .as_bytes()
                .chunks(SIGNATURE_TRYTES)
                .map(|chunk| pad_trytes(&String::from_utf8_lossy(chunk), SIGNATURE_TRYTES))
                .collect()
        };

        for fragment in fragments {
            bundle.push(Transaction {
                signature_message_fragment: fragment,
                address: transfer.address.clone(),
                value: 0,
                obsolete_tag: tag.clone(),
                timestamp,
                tag: tag.clone(),
                ..Default::default()
            });
        }
    }

    finalize(&mut bundle);
    Ok(bundle)
}

/// Assigns indices and writes the bundle hash into every transaction.
pub fn finalize(bundle: &mut [Transaction]) {
    let last_index = bundle.len() as i64 - 1;
    for (i, tx) in bundle.iter_mut().enumerate() {
        tx.current_index = i as i64;
        tx.last_index = last_index;
    }

    let hash = bundle_hash(bundle);
    for tx in bundle.iter_mut() {
        tx.bundle = hash.clone();
    }
}

pub fn bundle_hash(bundle: &[Transaction]) -> String {
    let mut curl = Curl::new();
    for tx in bundle {
        curl.absorb(&tx.essence_trits());
    }
    let mut hash = [0i8; HASH_LENGTH];
    curl.squeeze(&mut hash);
    trits_to_trytes(&hash)
}
