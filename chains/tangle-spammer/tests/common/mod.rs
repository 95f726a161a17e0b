//! In-memory node, connector and hash function shared by the integration tests.

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use core_logic::{Node, PowError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tangle_spammer::strategy::MILESTONE_ADDRESS;
use tangle_spammer::ternary::{int_to_trytes, pad_tag};
use tangle_spammer::transaction::NONCE_TRYTES;
use tangle_spammer::{
    seal_bundle, Connector, NodeApi, NodeInfo, PowFn, SpammerConfig, TipHashes, Transaction,
};

pub const TRUNK: &str =
    "TRUNK9999999999999999999999999999999999999999999999999999999999999999999999999999";
pub const BRANCH: &str =
    "BRANCH999999999999999999999999999999999999999999999999999999999999999999999999999";
pub const MILESTONE: &str =
    "MILESTONE99999999999999999999999999999999999999999999999999999999999999999999999";

/// Hands out distinct nonces without searching.
#[derive(Default)]
pub struct InstantPow {
    next: AtomicU64,
}

impl PowFn for InstantPow {
    fn name(&self) -> &'static str {
        "Instant"
    }

    fn search(&self, _trytes: &str, _mwm: u32) -> Result<String, PowError> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        Ok(int_to_trytes(n as i64, NONCE_TRYTES))
    }
}

pub struct MockNode {
    url: String,
    pow: InstantPow,
    trunk: String,
    branch: String,
    pub broadcasts: Mutex<Vec<Vec<Transaction>>>,
    pub attach_calls: AtomicUsize,
    pub inclusion_calls: AtomicUsize,
    pub fail_broadcast: AtomicBool,
    pub included: AtomicBool,
}

impl MockNode {
    pub fn new(url: &str) -> Arc<Self> {
        Self::with_tips(url, TRUNK, BRANCH)
    }

    pub fn with_tips(url: &str, trunk: &str, branch: &str) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_string(),
            pow: InstantPow::default(),
            trunk: trunk.to_string(),
            branch: branch.to_string(),
            broadcasts: Mutex::new(Vec::new()),
            attach_calls: AtomicUsize::new(0),
            inclusion_calls: AtomicUsize::new(0),
            fail_broadcast: AtomicBool::new(false),
            included: AtomicBool::new(false),
        })
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.lock().unwrap().len()
    }

    pub fn broadcast_hashes(&self) -> Vec<String> {
        self.broadcasts
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|tx| tx.hash())
            .collect()
    }

    fn body(hash: &str) -> Transaction {
        if hash == MILESTONE {
            Transaction {
                address: MILESTONE_ADDRESS.to_string(),
                ..Transaction::default()
            }
        } else {
            Transaction {
                value: 1,
                tag: pad_tag("OTHER"),
                ..Transaction::default()
            }
        }
    }
}

#[async_trait]
impl NodeApi for MockNode {
    fn url(&self) -> &str {
        &self.url
    }

    async fn get_tips(&self) -> Result<Vec<String>> {
        Ok(vec![self.trunk.clone(), self.branch.clone()])
    }

    async fn get_trytes(&self, hashes: &[String]) -> Result<Vec<Transaction>> {
        Ok(hashes.iter().map(|hash| Self::body(hash)).collect())
    }

    async fn get_transactions_to_approve(&self, _depth: u32) -> Result<TipHashes> {
        Ok(TipHashes {
            trunk_transaction: self.trunk.clone(),
            branch_transaction: self.branch.clone(),
        })
    }

    async fn get_node_info(&self) -> Result<NodeInfo> {
        Ok(NodeInfo {
            latest_milestone: MILESTONE.to_string(),
            latest_solid_subtangle_milestone: MILESTONE.to_string(),
            app_version: "mock".to_string(),
        })
    }

    async fn attach_to_tangle(
        &self,
        trunk: &str,
        branch: &str,
        mwm: u32,
        transactions: &[Transaction],
    ) -> Result<Vec<Transaction>> {
        self.attach_calls.fetch_add(1, Ordering::SeqCst);
        Ok(seal_bundle(trunk, branch, transactions.to_vec(), mwm, &self.pow)?)
    }

    async fn broadcast_transactions(&self, transactions: &[Transaction]) -> Result<()> {
        if self.fail_broadcast.load(Ordering::SeqCst) {
            bail!("node rejected the bundle");
        }
        self.broadcasts.lock().unwrap().push(transactions.to_vec());
        Ok(())
    }

    async fn get_latest_inclusion(&self, hashes: &[String]) -> Result<Vec<bool>> {
        self.inclusion_calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![self.included.load(Ordering::SeqCst); hashes.len()])
    }
}

/// Serves registered mock nodes by URL; unknown URLs fail to connect.
#[derive(Default)]
pub struct MockConnector {
    nodes: Mutex<HashMap<String, Arc<MockNode>>>,
}

impl MockConnector {
    pub fn with(nodes: &[Arc<MockNode>]) -> Arc<Self> {
        let connector = Self::default();
        {
            let mut map = connector.nodes.lock().unwrap();
            for node in nodes {
                map.insert(node.url().to_string(), Arc::clone(node));
            }
        }
        Arc::new(connector)
    }
}

impl Connector for MockConnector {
    fn connect(&self, node: &Node) -> Result<Arc<dyn NodeApi>> {
        match self.nodes.lock().unwrap().get(&node.url) {
            Some(mock) => Ok(Arc::clone(mock) as Arc<dyn NodeApi>),
            None => bail!("no mock node at {}", node.url),
        }
    }
}

pub fn address() -> String {
    "A".repeat(81)
}

pub fn config(nodes: &[Node]) -> SpammerConfig {
    SpammerConfig::builder()
        .nodes(nodes.iter().cloned())
        .destination_address(address())
        .tag("ENGINETEST")
        .message("HELLO")
        .mwm(1)
        .build()
        .unwrap()
}

/// Polls `check` every 10ms until it holds, failing the test after `limit`.
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(limit, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached within {:?}", limit);
}
