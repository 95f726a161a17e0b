//! Spammer engine.
//!
//! [`Spammer::start`] runs one spam run on the calling task until the run is
//! stopped, either by [`Spammer::stop`] or by the configured timeout. The run
//! owns a single [`CancellationToken`]; every task spawned for it observes that
//! token at each blocking point and is joined before `start` returns.
//!
//! # Task Layout
//!
//! ```text
//! tip fetcher (per node) ──tips──> main loop ──transactions──> spam worker (per node)
//!                                      │                              │
//!                                      └──────── metric events ───────┴──> metrics router
//! confirmation tracker (with a store) ───────────────────────────────────┘
//! ```

use anyhow::{Context, Result};
use core_logic::store::timestamp_key;
use core_logic::{ConfigError, Node, RunLedger, Summary, TxStore, SPAM_RESULT_TARGET};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bundle::Transfer;
use crate::config::SpammerConfig;
use crate::metrics::{Metric, MetricEvent, MetricsHandle, MetricsSender, MetricsView};
use crate::node::{Connector, HttpConnector, NodeApi};
use crate::pow::PowFn;
use crate::strategy::{classify_tips, TipPair};
use crate::ternary::{bytes_to_trytes, random_trytes};
use crate::worker::{RunContext, ShallowTransaction, Worker};

#[derive(Default)]
struct EngineState {
    running: bool,
    cancel: Option<CancellationToken>,
    metrics: Option<MetricsView>,
    run_key: Option<String>,
}

/// Counts itself in the live-task counter while alive.
struct LiveTask(Arc<AtomicUsize>);

impl LiveTask {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for LiveTask {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Spammer {
    config: Arc<SpammerConfig>,
    pow: Arc<dyn PowFn>,
    connector: Arc<dyn Connector>,
    store: Option<Arc<TxStore>>,
    relay: Option<mpsc::UnboundedSender<Metric>>,
    state: RwLock<EngineState>,
    live: Arc<AtomicUsize>,
}

impl Spammer {
    pub fn new(config: SpammerConfig, pow: Arc<dyn PowFn>) -> Self {
        Self {
            config: Arc::new(config),
            pow,
            connector: Arc::new(HttpConnector::default()),
            store: None,
            relay: None,
            state: RwLock::new(EngineState::default()),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_store(mut self, store: Arc<TxStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Forward every metric of every run to `relay`.
    pub fn with_relay(mut self, relay: mpsc::UnboundedSender<Metric>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn config(&self) -> &SpammerConfig {
        &self.config
    }

    pub fn pow(&self) -> &dyn PowFn {
        self.pow.as_ref()
    }

    fn read_state(&self) -> RwLockReadGuard<'_, EngineState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, EngineState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.read_state().running
    }

    /// Counters of the current run, or of the last one once stopped.
    pub fn summary(&self) -> Summary {
        self.read_state()
            .metrics
            .as_ref()
            .map(|view| view.summary())
            .unwrap_or_default()
    }

    /// Store key of the current or last run.
    pub fn run_key(&self) -> Option<String> {
        self.read_state().run_key.clone()
    }

    /// Engine tasks still alive. Zero once a run has fully stopped.
    pub fn live_tasks(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Signals the current run to stop. `start` returns once every task of
    /// the run has exited. A no-op when not running.
    pub fn stop(&self) -> Result<()> {
        let state = self.read_state();
        if let Some(cancel) = state.cancel.as_ref().filter(|_| state.running) {
            info!("Stopping spammer");
            cancel.cancel();
        }
        Ok(())
    }

    /// Runs until stopped. Returns `Ok` immediately when already running.
    pub async fn start(&self) -> Result<()> {
        let cancel = {
            let mut state = self.write_state();
            if state.running {
                return Ok(());
            }
            let cancel = CancellationToken::new();
            state.running = true;
            state.cancel = Some(cancel.clone());
            cancel
        };

        let result = match self.connect_all() {
            Ok(apis) => self.run(apis, cancel.clone()).await,
            Err(e) => Err(e),
        };

        let mut state = self.write_state();
        state.running = false;
        state.cancel = None;
        result
    }

    fn connect_all(&self) -> Result<Vec<(Node, Arc<dyn NodeApi>)>> {
        if self.config.nodes.is_empty() {
            return Err(ConfigError::MissingField {
                field: "nodes".to_string(),
            }
            .into());
        }
        self.config
            .nodes
            .iter()
            .map(|node| {
                self.connector
                    .connect(node)
                    .with_context(|| format!("Failed to connect to {}", node.url))
                    .map(|api| (node.clone(), api))
            })
            .collect()
    }

    async fn run(&self, apis: Vec<(Node, Arc<dyn NodeApi>)>, cancel: CancellationToken) -> Result<()> {
        let config = Arc::clone(&self.config);
        let nodes: Vec<&str> = apis.iter().map(|(node, _)| node.url.as_str()).collect();
        info!("Spammer starting, nodes: {:?}", nodes);

        let seed = random_trytes(81);
        let ledger = RunLedger::new(self.store.clone(), timestamp_key());
        if let Err(e) = ledger.open().await {
            warn!("Failed to open run in store: {:#}", e);
        }
        log_run(&ledger, &format!("run started against {}", nodes.join(", "))).await;

        let metrics = MetricsHandle::spawn(ledger.clone(), self.relay.clone());
        let view = metrics.view();
        {
            let mut state = self.write_state();
            state.metrics = Some(view.clone());
            state.run_key = Some(ledger.run_key().to_string());
        }

        let ctx = Arc::new(RunContext {
            config: Arc::clone(&config),
            pow: Arc::clone(&self.pow),
            ledger: ledger.clone(),
            metrics: metrics.sender(),
            cancel: cancel.clone(),
        });

        let (tips_tx, mut tips_rx) = mpsc::channel::<TipPair>(1);
        let (txs_tx, txs_rx) = mpsc::channel::<ShallowTransaction>(1);
        let shared_rx = Arc::new(Mutex::new(txs_rx));
        let mut tasks = JoinSet::new();

        if let Some(timeout) = config.timeout {
            let token = cancel.clone();
            let live = LiveTask::new(&self.live);
            tasks.spawn(async move {
                let _live = live;
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        info!("Run timeout of {:?} reached", timeout);
                        token.cancel();
                    }
                }
            });
        }

        for (node, api) in &apis {
            let worker = Arc::new(Worker::new(node.clone(), Arc::clone(api), Arc::clone(&ctx)));

            let fetcher = Arc::clone(&worker);
            let tips = tips_tx.clone();
            let live = LiveTask::new(&self.live);
            tasks.spawn(async move {
                let _live = live;
                fetcher.fetch_tips(tips).await;
            });

            let spammer = worker;
            let rx = Arc::clone(&shared_rx);
            let live = LiveTask::new(&self.live);
            tasks.spawn(async move {
                let _live = live;
                spammer.spam(rx).await;
            });
        }
        drop(tips_tx);

        if ledger.is_enabled() {
            let api = Arc::clone(&apis[0].1);
            let ledger = ledger.clone();
            let sender = metrics.sender();
            let token = cancel.clone();
            let interval = config.confirmation_interval;
            let live = LiveTask::new(&self.live);
            tasks.spawn(async move {
                let _live = live;
                track_confirmations(api.as_ref(), &ledger, &sender, interval, &token).await;
            });
        }

        self.produce(&apis, &ctx, &view, &seed, &mut tips_rx, &txs_tx).await;

        info!("Waiting for workers to terminate...");
        cancel.cancel();
        drop(txs_tx);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Spammer task failed: {}", e);
            }
        }

        metrics.stop().await;
        let summary = view.summary();
        log_run(
            &ledger,
            &format!(
                "run stopped: {}",
                serde_json::to_string(&summary).unwrap_or_default()
            ),
        )
        .await;
        info!(
            "Spammer terminated: {} succeeded, {} failed",
            summary.txs_succeeded, summary.txs_failed
        );
        Ok(())
    }

    /// Main production loop: one prepared bundle per tip pair.
    async fn produce(
        &self,
        apis: &[(Node, Arc<dyn NodeApi>)],
        ctx: &RunContext,
        view: &MetricsView,
        seed: &str,
        tips: &mut mpsc::Receiver<TipPair>,
        transactions: &mpsc::Sender<ShallowTransaction>,
    ) {
        let config = &ctx.config;
        let cancel = &ctx.cancel;

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let (node, api) = &apis[rand::thread_rng().gen_range(0..apis.len())];
            let message = if config.message_metrics {
                match serde_json::to_vec(&view.summary()) {
                    Ok(json) => bytes_to_trytes(&json),
                    Err(_) => bytes_to_trytes(b"metrics error"),
                }
            } else {
                config.message.clone()
            };
            let transfers = [Transfer {
                address: config.destination_address.clone(),
                value: 0,
                tag: config.tag.clone(),
                message,
            }];

            let prepared = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                prepared = api.prepare_transfers(seed, &transfers, config.security_level) => prepared,
            };
            let bundle = match prepared {
                Ok(bundle) => bundle,
                Err(e) => {
                    ctx.metrics.emit(MetricEvent::FailedTx);
                    debug!("Error preparing transfer on {}: {:#}", node.url, e);
                    tokio::task::yield_now().await;
                    continue;
                }
            };

            let pair = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                pair = tips.recv() => match pair {
                    Some(pair) => pair,
                    None => return,
                },
            };
            for event in classify_tips(&pair, &config.tag) {
                if matches!(
                    event,
                    MetricEvent::BadTrunk | MetricEvent::BadBranch | MetricEvent::BadTrunkAndBranch
                ) {
                    info!(
                        target: SPAM_RESULT_TARGET,
                        "BAD TIPS {:?}: trunk {} branch {}", event, pair.trunk_hash, pair.branch_hash
                    );
                }
                ctx.metrics.emit(event);
            }

            let shallow = ShallowTransaction {
                trunk: pair.trunk_hash,
                branch: pair.branch_hash,
                transactions: bundle,
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                sent = transactions.send(shallow) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn log_run(ledger: &RunLedger, message: &str) {
    if let Err(e) = ledger.log(message).await {
        warn!("Failed to write run log: {:#}", e);
    }
}

async fn track_confirmations(
    api: &dyn NodeApi,
    ledger: &RunLedger,
    metrics: &MetricsSender,
    interval: Duration,
    cancel: &CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        debug!("Checking confirmation rate");
        let update = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            update = update_confirmed_transactions(api, ledger, metrics) => update,
        };
        if let Err(e) = update {
            warn!("Error checking confirmation rate: {:#}", e);
        }
    }
}

/// Drops newly confirmed hashes from the unconfirmed set and emits the
/// resulting confirmation rate. Returns the rate, `None` before anything was
/// sent. Never adds hashes back.
pub async fn update_confirmed_transactions(
    api: &dyn NodeApi,
    ledger: &RunLedger,
    metrics: &MetricsSender,
) -> Result<Option<f64>> {
    let sent = ledger.sent_count().await?;
    if sent == 0 {
        return Ok(None);
    }

    let unconfirmed = ledger.unconfirmed_hashes().await?;
    let mut remaining = unconfirmed.len() as u64;
    if !unconfirmed.is_empty() {
        let states = api
            .get_latest_inclusion(&unconfirmed)
            .await
            .context("getInclusionStates failed")?;
        let confirmed: Vec<String> = unconfirmed
            .iter()
            .zip(states)
            .filter(|(_, included)| *included)
            .map(|(hash, _)| hash.clone())
            .collect();

        if !confirmed.is_empty() {
            debug!("Removing {} txns from unconfirmed", confirmed.len());
            ledger.remove_confirmed_transactions(&confirmed).await?;
            remaining -= confirmed.len() as u64;
        }
    }

    let rate = 100.0 * sent.saturating_sub(remaining) as f64 / sent as f64;
    metrics.emit(MetricEvent::ConfirmationRate(rate));
    Ok(Some(rate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeInfo, TipHashes};
    use crate::transaction::Transaction;
    use async_trait::async_trait;
    use core_logic::StoredTransaction;
    use std::collections::HashSet;
    use tempfile::TempDir;

    /// Reports the hashes in `confirmed` as included.
    #[derive(Default)]
    struct InclusionNode {
        confirmed: std::sync::Mutex<HashSet<String>>,
    }

    impl InclusionNode {
        fn confirm(&self, hashes: &[&str]) {
            let mut confirmed = self.confirmed.lock().unwrap();
            confirmed.extend(hashes.iter().map(|h| h.to_string()));
        }

        fn forget(&self) {
            self.confirmed.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl NodeApi for InclusionNode {
        fn url(&self) -> &str {
            "http://inclusion.test"
        }

        async fn get_tips(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn get_trytes(&self, _hashes: &[String]) -> Result<Vec<Transaction>> {
            Ok(Vec::new())
        }

        async fn get_transactions_to_approve(&self, _depth: u32) -> Result<TipHashes> {
            anyhow::bail!("unused")
        }

        async fn get_node_info(&self) -> Result<NodeInfo> {
            anyhow::bail!("unused")
        }

        async fn attach_to_tangle(
            &self,
            _trunk: &str,
            _branch: &str,
            _mwm: u32,
            _transactions: &[Transaction],
        ) -> Result<Vec<Transaction>> {
            anyhow::bail!("unused")
        }

        async fn broadcast_transactions(&self, _transactions: &[Transaction]) -> Result<()> {
            Ok(())
        }

        async fn get_latest_inclusion(&self, hashes: &[String]) -> Result<Vec<bool>> {
            let confirmed = self.confirmed.lock().unwrap();
            Ok(hashes.iter().map(|h| confirmed.contains(h)).collect())
        }
    }

    fn stored(hash: &str) -> StoredTransaction {
        StoredTransaction {
            hash: hash.to_string(),
            trytes: "9".repeat(2673),
        }
    }

    #[tokio::test]
    async fn test_confirmation_rate_is_monotone() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("confirm.db");
        let store = Arc::new(TxStore::new(db.to_str().unwrap()).await.unwrap());
        let ledger = RunLedger::new(Some(store), "run");
        ledger.open().await.unwrap();
        let (metrics, _events) = MetricsSender::detached();
        let node = InclusionNode::default();

        assert_eq!(
            update_confirmed_transactions(&node, &ledger, &metrics).await.unwrap(),
            None
        );

        let sent: Vec<_> = ["AAA", "BBB", "CCC", "DDD"]
            .iter()
            .map(|h| stored(h))
            .collect();
        ledger.log_sent_transactions(&sent).await.unwrap();

        node.confirm(&["AAA", "CCC"]);
        let rate = update_confirmed_transactions(&node, &ledger, &metrics).await.unwrap();
        assert_eq!(rate, Some(50.0));
        assert_eq!(ledger.unconfirmed_hashes().await.unwrap(), vec!["BBB", "DDD"]);

        // a node forgetting inclusions never puts hashes back
        node.forget();
        let rate = update_confirmed_transactions(&node, &ledger, &metrics).await.unwrap();
        assert_eq!(rate, Some(50.0));

        node.confirm(&["BBB", "DDD"]);
        let rate = update_confirmed_transactions(&node, &ledger, &metrics).await.unwrap();
        assert_eq!(rate, Some(100.0));
        assert!(ledger.unconfirmed_hashes().await.unwrap().is_empty());
        assert_eq!(ledger.sent_count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_confirmation_without_store() {
        let node = InclusionNode::default();
        let (metrics, _events) = MetricsSender::detached();
        let rate = update_confirmed_transactions(&node, &RunLedger::disabled(), &metrics)
            .await
            .unwrap();
        assert_eq!(rate, None);
    }
}
