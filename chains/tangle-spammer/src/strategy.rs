//! Tip selection.

use anyhow::{bail, Context, Result};
use core_logic::{ConfigError, RunLedger};
use rand::Rng;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::metrics::{MetricEvent, MetricsSender};
use crate::node::NodeApi;
use crate::ternary::pad_tag;
use crate::transaction::Transaction;

/// Address of the coordinator's milestones.
pub const MILESTONE_ADDRESS: &str =
    "KPWCHICGJZXKE9GSUDXZYUAPLHAKAHYHDXNPHENTERYMMBQOPSQIDENXKLKCEYCPVTZQLEEJVYJZV9BWU";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TipStrategy {
    /// Ask the node's tip selection (`getTransactionsToApprove`).
    #[default]
    TransactionsToApprove,
    /// Approve the latest milestone and a random non-zero-value tip.
    NonZeroPromote,
}

impl TipStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            TipStrategy::TransactionsToApprove => "",
            TipStrategy::NonZeroPromote => "non zero promote",
        }
    }

    /// One attempt at a tip pair. `Ok(None)` means nothing usable was found
    /// this round.
    pub async fn fetch(
        &self,
        api: &dyn NodeApi,
        ledger: &RunLedger,
        metrics: &MetricsSender,
        depth: u32,
    ) -> Result<Option<TipPair>> {
        match self {
            TipStrategy::TransactionsToApprove => {
                transactions_to_approve(api, ledger, metrics, depth)
                    .await
                    .map(Some)
            }
            TipStrategy::NonZeroPromote => non_zero_promote(api).await,
        }
    }
}

impl FromStr for TipStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" => Ok(TipStrategy::TransactionsToApprove),
            "non zero promote" => Ok(TipStrategy::NonZeroPromote),
            _ => Err(ConfigError::UnknownStrategy {
                name: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for TipStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TipStrategy::TransactionsToApprove => write!(f, "transactions to approve"),
            TipStrategy::NonZeroPromote => write!(f, "non zero promote"),
        }
    }
}

/// Two transactions to approve, with their bodies.
#[derive(Debug, Clone)]
pub struct TipPair {
    pub trunk_hash: String,
    pub branch_hash: String,
    pub trunk: Transaction,
    pub branch: Transaction,
}

pub async fn transactions_to_approve(
    api: &dyn NodeApi,
    ledger: &RunLedger,
    metrics: &MetricsSender,
    depth: u32,
) -> Result<TipPair> {
    let tips = api
        .get_transactions_to_approve(depth)
        .await
        .context("getTransactionsToApprove failed")?;

    let (trunk, branch) = load_or_fetch(
        api,
        ledger,
        metrics,
        &tips.trunk_transaction,
        &tips.branch_transaction,
    )
    .await?;

    Ok(TipPair {
        trunk_hash: tips.trunk_transaction,
        branch_hash: tips.branch_transaction,
        trunk,
        branch,
    })
}

/// Resolves both tip bodies, cache first. Store failures only cost a fetch.
async fn load_or_fetch(
    api: &dyn NodeApi,
    ledger: &RunLedger,
    metrics: &MetricsSender,
    trunk_hash: &str,
    branch_hash: &str,
) -> Result<(Transaction, Transaction)> {
    let hashes = [trunk_hash.to_string(), branch_hash.to_string()];
    let cached = match ledger.get_transactions(&hashes).await {
        Ok(cached) => cached,
        Err(e) => {
            warn!("Failed to load cached tips: {:#}", e);
            vec![None, None]
        }
    };

    let mut resolved: [Option<Transaction>; 2] = [None, None];
    let mut missing = Vec::new();
    for (i, hash) in hashes.iter().enumerate() {
        let parsed = cached
            .get(i)
            .cloned()
            .flatten()
            .and_then(|trytes| Transaction::from_trytes(&trytes).ok());
        match parsed {
            Some(tx) => {
                metrics.emit(MetricEvent::CacheHit);
                resolved[i] = Some(tx);
            }
            None => {
                metrics.emit(MetricEvent::CacheMiss);
                missing.push((i, hash.clone()));
            }
        }
    }

    if !missing.is_empty() {
        let request: Vec<String> = missing.iter().map(|(_, h)| h.clone()).collect();
        let fetched = api
            .get_trytes(&request)
            .await
            .context("Failed to fetch tips")?;
        if fetched.len() != request.len() {
            bail!(
                "Node returned {} transactions for {} hashes",
                fetched.len(),
                request.len()
            );
        }

        let stored: Vec<_> = request
            .iter()
            .zip(&fetched)
            .map(|(hash, tx)| core_logic::StoredTransaction {
                hash: hash.clone(),
                trytes: tx.to_trytes(),
            })
            .collect();
        if let Err(e) = ledger.store_transactions(&stored).await {
            warn!("Failed to cache tips: {:#}", e);
        }

        for ((i, _), tx) in missing.into_iter().zip(fetched) {
            resolved[i] = Some(tx);
        }
    }

    match resolved {
        [Some(trunk), Some(branch)] => Ok((trunk, branch)),
        _ => bail!("Tip bodies could not be resolved"),
    }
}

pub async fn non_zero_promote(api: &dyn NodeApi) -> Result<Option<TipPair>> {
    let mut hashes = api.get_tips().await.context("getTips failed")?;

    let mut branch = None;
    while !hashes.is_empty() {
        let pick = rand::thread_rng().gen_range(0..hashes.len());
        let candidate = api
            .get_trytes(std::slice::from_ref(&hashes[pick]))
            .await
            .context("Failed to fetch candidate tip")?
            .into_iter()
            .next()
            .context("Node returned no body for candidate tip")?;

        if candidate.value == 0 {
            hashes.swap_remove(pick);
            continue;
        }
        branch = Some((hashes.swap_remove(pick), candidate));
        break;
    }

    let Some((branch_hash, branch)) = branch else {
        debug!("No non-zero tip among {}", api.url());
        return Ok(None);
    };

    let info = api.get_node_info().await.context("getNodeInfo failed")?;
    let trunk = api
        .get_trytes(std::slice::from_ref(&info.latest_milestone))
        .await
        .context("Failed to fetch latest milestone")?
        .into_iter()
        .next()
        .context("Node returned no body for the latest milestone")?;

    Ok(Some(TipPair {
        trunk_hash: info.latest_milestone,
        branch_hash,
        trunk,
        branch,
    }))
}

/// Diagnostic events for a tip pair: a milestone event if either tip is a
/// milestone, and a bad-tip event if either carries our own tag.
pub fn classify_tips(tips: &TipPair, tag: &str) -> Vec<MetricEvent> {
    let mut events = Vec::new();

    if tips.trunk.address.contains(MILESTONE_ADDRESS) {
        events.push(MetricEvent::MilestoneTrunk);
    } else if tips.branch.address.contains(MILESTONE_ADDRESS) {
        events.push(MetricEvent::MilestoneBranch);
    }

    let padded = pad_tag(tag);
    let trunk_is_bad = tips.trunk.tag == padded;
    let branch_is_bad = tips.branch.tag == padded;
    match (trunk_is_bad, branch_is_bad) {
        (true, true) => events.push(MetricEvent::BadTrunkAndBranch),
        (true, false) => events.push(MetricEvent::BadTrunk),
        (false, true) => events.push(MetricEvent::BadBranch),
        (false, false) => {}
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeInfo, TipHashes};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const MILESTONE: &str = "MILESTONE9";

    /// Serves a fixed tip set; `values` holds the value of each tip.
    struct TipsNode {
        values: HashMap<String, i64>,
        fetched: Mutex<Vec<String>>,
    }

    impl TipsNode {
        fn new(values: &[(&str, i64)]) -> Self {
            Self {
                values: values.iter().map(|(h, v)| (h.to_string(), *v)).collect(),
                fetched: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl NodeApi for TipsNode {
        fn url(&self) -> &str {
            "http://tips.test"
        }

        async fn get_tips(&self) -> Result<Vec<String>> {
            Ok(self.values.keys().cloned().collect())
        }

        async fn get_trytes(&self, hashes: &[String]) -> Result<Vec<Transaction>> {
            self.fetched.lock().unwrap().extend(hashes.iter().cloned());
            Ok(hashes
                .iter()
                .map(|hash| match self.values.get(hash) {
                    Some(value) => Transaction {
                        value: *value,
                        ..Default::default()
                    },
                    None => tx(MILESTONE_ADDRESS, ""),
                })
                .collect())
        }

        async fn get_transactions_to_approve(&self, _depth: u32) -> Result<TipHashes> {
            bail!("unused")
        }

        async fn get_node_info(&self) -> Result<NodeInfo> {
            Ok(NodeInfo {
                latest_milestone: MILESTONE.to_string(),
                latest_solid_subtangle_milestone: MILESTONE.to_string(),
                app_version: "test".to_string(),
            })
        }

        async fn attach_to_tangle(
            &self,
            _trunk: &str,
            _branch: &str,
            _mwm: u32,
            _transactions: &[Transaction],
        ) -> Result<Vec<Transaction>> {
            bail!("unused")
        }

        async fn broadcast_transactions(&self, _transactions: &[Transaction]) -> Result<()> {
            bail!("unused")
        }

        async fn get_latest_inclusion(&self, hashes: &[String]) -> Result<Vec<bool>> {
            Ok(vec![false; hashes.len()])
        }
    }

    fn tx(address: &str, tag: &str) -> Transaction {
        Transaction {
            address: address.to_string(),
            tag: pad_tag(tag),
            ..Default::default()
        }
    }

    fn pair(trunk: Transaction, branch: Transaction) -> TipPair {
        TipPair {
            trunk_hash: "T".repeat(81),
            branch_hash: "B".repeat(81),
            trunk,
            branch,
        }
    }

    fn kinds(events: &[MetricEvent]) -> Vec<&'static str> {
        events
            .iter()
            .map(|e| match e {
                MetricEvent::MilestoneTrunk => "milestone_trunk",
                MetricEvent::MilestoneBranch => "milestone_branch",
                MetricEvent::BadTrunk => "bad_trunk",
                MetricEvent::BadBranch => "bad_branch",
                MetricEvent::BadTrunkAndBranch => "bad_both",
                _ => "other",
            })
            .collect()
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!("".parse::<TipStrategy>().unwrap(), TipStrategy::TransactionsToApprove);
        assert_eq!(
            "Non Zero Promote".parse::<TipStrategy>().unwrap(),
            TipStrategy::NonZeroPromote
        );
        assert_eq!(
            "random".parse::<TipStrategy>(),
            Err(ConfigError::UnknownStrategy {
                name: "random".to_string()
            })
        );
        assert_eq!(TipStrategy::NonZeroPromote.name(), "non zero promote");
    }

    #[test]
    fn test_classify_bad_tips() {
        let ours = "SPAM";
        let other = "OTHER";
        let addr = "C".repeat(81);

        let both = pair(tx(&addr, ours), tx(&addr, ours));
        assert_eq!(kinds(&classify_tips(&both, ours)), vec!["bad_both"]);

        let trunk = pair(tx(&addr, ours), tx(&addr, other));
        assert_eq!(kinds(&classify_tips(&trunk, ours)), vec!["bad_trunk"]);

        let branch = pair(tx(&addr, other), tx(&addr, ours));
        assert_eq!(kinds(&classify_tips(&branch, ours)), vec!["bad_branch"]);

        let clean = pair(tx(&addr, other), tx(&addr, other));
        assert!(classify_tips(&clean, ours).is_empty());
    }

    #[test]
    fn test_classify_milestones() {
        let addr = "C".repeat(81);
        let trunk_ms = pair(tx(MILESTONE_ADDRESS, ""), tx(MILESTONE_ADDRESS, "SPAM"));
        assert_eq!(
            kinds(&classify_tips(&trunk_ms, "SPAM")),
            vec!["milestone_trunk", "bad_branch"]
        );

        let branch_ms = pair(tx(&addr, ""), tx(MILESTONE_ADDRESS, ""));
        assert_eq!(kinds(&classify_tips(&branch_ms, "SPAM")), vec!["milestone_branch"]);
    }

    #[tokio::test]
    async fn test_non_zero_promote_skips_zero_value_tips() {
        let node = TipsNode::new(&[("ZERO1", 0), ("FUNDED", 5), ("ZERO2", 0), ("ZERO3", 0)]);

        for _ in 0..5 {
            let pair = non_zero_promote(&node).await.unwrap().unwrap();
            assert_eq!(pair.branch_hash, "FUNDED");
            assert_eq!(pair.branch.value, 5);
            assert_eq!(pair.trunk_hash, MILESTONE);
            assert!(pair.trunk.address.contains(MILESTONE_ADDRESS));
        }
        assert!(node.fetched.lock().unwrap().iter().any(|h| h == MILESTONE));

        let events = classify_tips(&non_zero_promote(&node).await.unwrap().unwrap(), "SPAM");
        assert_eq!(kinds(&events), vec!["milestone_trunk"]);
    }

    #[tokio::test]
    async fn test_non_zero_promote_without_funded_tips() {
        let node = TipsNode::new(&[("ZERO1", 0), ("ZERO2", 0)]);
        assert!(non_zero_promote(&node).await.unwrap().is_none());

        // every zero tip was tried once, and no milestone was requested
        {
            let fetched = node.fetched.lock().unwrap();
            assert_eq!(fetched.len(), 2);
            assert!(!fetched.iter().any(|h| h == MILESTONE));
        }

        let empty = TipsNode::new(&[]);
        assert!(non_zero_promote(&empty).await.unwrap().is_none());
    }
}
