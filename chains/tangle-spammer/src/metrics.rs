//! Metrics router.
//!
//! Every task of a run reports through a [`MetricsSender`]. A single router
//! task owns the counters, records sent bundles in the run ledger, prints the
//! per-bundle result line and forwards [`Metric`]s to an optional relay.

use core_logic::{Node, RunLedger, Summary, Tally, SPAM_RESULT_TARGET};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bundle::bundle_hash;
use crate::transaction::Transaction;

/// A bundle accepted by a node.
#[derive(Debug, Clone)]
pub struct SentBundle {
    pub transactions: Vec<Transaction>,
    pub node: Node,
}

#[derive(Debug, Clone)]
pub enum MetricEvent {
    MilestoneTrunk,
    MilestoneBranch,
    BadTrunk,
    BadBranch,
    BadTrunkAndBranch,
    FailedTx,
    SuccessfulTx(SentBundle),
    CacheHit,
    CacheMiss,
    ConfirmationRate(f64),
}

/// Compact identity of a sent bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxData {
    pub hash: String,
    pub count: usize,
    pub node: String,
}

impl TxData {
    /// Uses the bundle hash for multi-transaction bundles, the transaction
    /// hash otherwise.
    pub fn from_bundle(sent: &SentBundle) -> Self {
        let hash = match sent.transactions.as_slice() {
            [single] => single.hash(),
            many => bundle_hash(many),
        };
        Self {
            hash,
            count: sent.transactions.len(),
            node: sent.node.url.clone(),
        }
    }
}

/// What listeners receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Metric {
    MilestoneTrunk,
    MilestoneBranch,
    BadTrunk,
    BadBranch,
    BadTrunkAndBranch,
    FailedTx,
    SuccessfulTx(TxData),
    CacheHit,
    CacheMiss,
    ConfirmationRate(f64),
    Summary(Summary),
}

#[derive(Debug, Clone)]
pub struct MetricsSender {
    tx: mpsc::UnboundedSender<MetricEvent>,
}

impl MetricsSender {
    /// Events sent after the router stopped are dropped.
    pub fn emit(&self, event: MetricEvent) {
        let _ = self.tx.send(event);
    }

    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<MetricEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

/// Read-only view on the counters of a run.
#[derive(Debug, Clone)]
pub struct MetricsView {
    tally: Arc<Mutex<Tally>>,
    started: Instant,
}

impl MetricsView {
    pub fn summary(&self) -> Summary {
        let elapsed = self.started.elapsed();
        match self.tally.lock() {
            Ok(tally) => tally.summary(elapsed),
            Err(poisoned) => poisoned.into_inner().summary(elapsed),
        }
    }
}

pub struct MetricsHandle {
    sender: MetricsSender,
    view: MetricsView,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Router {
    view: MetricsView,
    ledger: RunLedger,
    relay: Option<mpsc::UnboundedSender<Metric>>,
}

impl MetricsHandle {
    pub fn spawn(ledger: RunLedger, relay: Option<mpsc::UnboundedSender<Metric>>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let view = MetricsView {
            tally: Arc::new(Mutex::new(Tally::default())),
            started: Instant::now(),
        };
        let cancel = CancellationToken::new();

        let mut router = Router {
            view: view.clone(),
            ledger,
            relay,
        };
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => router.handle(event).await,
                        None => break,
                    },
                }
            }
            // Drain what was queued before the stop.
            rx.close();
            while let Ok(event) = rx.try_recv() {
                router.handle(event).await;
            }
        });

        Self {
            sender: MetricsSender { tx },
            view,
            cancel,
            task,
        }
    }

    pub fn sender(&self) -> MetricsSender {
        self.sender.clone()
    }

    pub fn view(&self) -> MetricsView {
        self.view.clone()
    }

    pub fn summary(&self) -> Summary {
        self.view.summary()
    }

    /// Stops the router after processing every event already queued.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Metrics router terminated abnormally: {}", e);
        }
    }
}

impl Router {
    fn update<F: FnOnce(&mut Tally)>(&self, f: F) {
        match self.view.tally.lock() {
            Ok(mut tally) => f(&mut tally),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn relay(&mut self, metric: Metric) {
        if let Some(relay) = &self.relay {
            if relay.send(metric).is_err() {
                self.relay = None;
            }
        }
    }

    async fn handle(&mut self, event: MetricEvent) {
        let relayed = match event {
            MetricEvent::MilestoneTrunk => {
                self.update(|t| t.milestone_trunk += 1);
                Metric::MilestoneTrunk
            }
            MetricEvent::MilestoneBranch => {
                self.update(|t| t.milestone_branch += 1);
                Metric::MilestoneBranch
            }
            MetricEvent::BadTrunk => {
                self.update(|t| t.bad_trunk += 1);
                Metric::BadTrunk
            }
            MetricEvent::BadBranch => {
                self.update(|t| t.bad_branch += 1);
                Metric::BadBranch
            }
            MetricEvent::BadTrunkAndBranch => {
                self.update(|t| t.bad_trunk_and_branch += 1);
                Metric::BadTrunkAndBranch
            }
            MetricEvent::FailedTx => {
                self.update(|t| t.failed += 1);
                Metric::FailedTx
            }
            MetricEvent::CacheHit => {
                self.update(|t| t.cached += 1);
                Metric::CacheHit
            }
            MetricEvent::CacheMiss => {
                self.update(|t| t.fetched += 1);
                Metric::CacheMiss
            }
            MetricEvent::ConfirmationRate(rate) => {
                self.update(|t| t.confirmation_rate = rate);
                Metric::ConfirmationRate(rate)
            }
            MetricEvent::SuccessfulTx(sent) => {
                self.update(|t| t.succeeded += 1);
                self.record_success(sent).await;
                return;
            }
        };
        self.relay(relayed);
    }

    async fn record_success(&mut self, sent: SentBundle) {
        let stored: Vec<_> = sent.transactions.iter().map(|tx| tx.to_stored()).collect();
        if let Err(e) = self.ledger.log_sent_transactions(&stored).await {
            warn!("Failed to record sent transactions: {:#}", e);
        }

        let data = TxData::from_bundle(&sent);
        let kind = if data.count > 1 { "bundle" } else { "transaction" };
        let summary = self.view.summary();

        info!(
            target: SPAM_RESULT_TARGET,
            "SUCCESS {} sent to {} https://thetangle.org/{}/{}", kind, sent.node.url, kind, data.hash
        );
        info!(
            target: SPAM_RESULT_TARGET,
            "{:.2} TPS | error rate {:.0}% | confirmed {:.2}% | count {} | milestone trunk {} branch {} | bad trunk {} branch {} both {} | cached {} fetched {}",
            summary.tps,
            summary.error_rate,
            summary.confirmation_rate,
            summary.txs_succeeded,
            summary.milestone_trunk,
            summary.milestone_branch,
            summary.bad_trunk,
            summary.bad_branch,
            summary.bad_trunk_and_branch,
            summary.cached_tx,
            summary.new_tx,
        );

        self.relay(Metric::Summary(summary));
        self.relay(Metric::SuccessfulTx(data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sent(count: usize) -> SentBundle {
        let tx = Transaction {
            address: "A".repeat(81),
            ..Default::default()
        };
        SentBundle {
            transactions: vec![tx; count],
            node: Node::new("http://node:14265", false),
        }
    }

    #[test]
    fn test_metric_wire_shape() {
        let json = serde_json::to_value(Metric::ConfirmationRate(42.5)).unwrap();
        assert_eq!(json["kind"], "confirmation_rate");
        assert_eq!(json["data"], 42.5);

        let json = serde_json::to_value(Metric::BadTrunk).unwrap();
        assert_eq!(json["kind"], "bad_trunk");
    }

    #[test]
    fn test_tx_data_hash_choice() {
        let single = sent(1);
        assert_eq!(TxData::from_bundle(&single).hash, single.transactions[0].hash());

        let many = sent(2);
        let data = TxData::from_bundle(&many);
        assert_eq!(data.hash, bundle_hash(&many.transactions));
        assert_eq!(data.count, 2);
        assert_eq!(data.node, "http://node:14265");
    }

    #[tokio::test]
    async fn test_router_counts_and_relays() {
        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
        let handle = MetricsHandle::spawn(RunLedger::disabled(), Some(relay_tx));
        let sender = handle.sender();

        sender.emit(MetricEvent::BadTrunk);
        sender.emit(MetricEvent::FailedTx);
        sender.emit(MetricEvent::SuccessfulTx(sent(1)));
        sender.emit(MetricEvent::ConfirmationRate(50.0));
        let view = handle.view();
        handle.stop().await;

        let summary = view.summary();
        assert_eq!(summary.bad_trunk, 1);
        assert_eq!(summary.bad_branch, 0);
        assert_eq!(summary.txs_failed, 1);
        assert_eq!(summary.txs_succeeded, 1);
        assert_eq!(summary.error_rate, 50.0);
        assert_eq!(summary.confirmation_rate, 50.0);

        let mut relayed = Vec::new();
        while let Ok(metric) = relay_rx.try_recv() {
            relayed.push(metric);
        }
        assert_eq!(relayed.len(), 5);
        assert_eq!(relayed[0], Metric::BadTrunk);
        assert_eq!(relayed[1], Metric::FailedTx);
        assert!(matches!(relayed[2], Metric::Summary(_)));
        assert!(matches!(relayed[3], Metric::SuccessfulTx(_)));
        assert_eq!(relayed[4], Metric::ConfirmationRate(50.0));
    }
}
