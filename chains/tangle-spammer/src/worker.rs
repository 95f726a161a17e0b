//! Per-node workers.
//!
//! Every node gets two tasks: a tip fetcher feeding the shared `tips` channel
//! and a spam worker draining the shared `transactions` channel. Both stop as
//! soon as the run's cancellation token fires.

use anyhow::{bail, Context, Result};
use core_logic::{Node, RunLedger, SPAM_RESULT_TARGET};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SpammerConfig;
use crate::metrics::{MetricEvent, MetricsSender, SentBundle};
use crate::node::NodeApi;
use crate::pow::{pow_lock, seal_bundle, PowFn};
use crate::strategy::TipPair;
use crate::transaction::Transaction;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// An unsealed bundle bound to the tips it will approve.
#[derive(Debug, Clone)]
pub struct ShallowTransaction {
    pub trunk: String,
    pub branch: String,
    pub transactions: Vec<Transaction>,
}

pub type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

/// State shared by every task of one run.
pub struct RunContext {
    pub config: Arc<SpammerConfig>,
    pub pow: Arc<dyn PowFn>,
    pub ledger: RunLedger,
    pub metrics: MetricsSender,
    pub cancel: CancellationToken,
}

pub struct Worker {
    node: Node,
    api: Arc<dyn NodeApi>,
    ctx: Arc<RunContext>,
}

impl Worker {
    pub fn new(node: Node, api: Arc<dyn NodeApi>, ctx: Arc<RunContext>) -> Self {
        Self { node, api, ctx }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Pushes tip pairs until cancelled. Failed attempts back off from 10ms
    /// up to 1s.
    pub async fn fetch_tips(&self, tips: mpsc::Sender<TipPair>) {
        let cancel = &self.ctx.cancel;
        let strategy = self.ctx.config.strategy;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                attempt = strategy.fetch(
                    self.api.as_ref(),
                    &self.ctx.ledger,
                    &self.ctx.metrics,
                    self.ctx.config.depth,
                ) => attempt,
            };

            match attempt {
                Ok(Some(pair)) => {
                    backoff = INITIAL_BACKOFF;
                    debug!("Got tips from {}", self.node.url);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        sent = tips.send(pair) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
                Ok(None) => {
                    debug!("No usable tips from {}, retrying", self.node.url);
                    if !self.pause(backoff).await {
                        return;
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => {
                    debug!("Tip selection on {} failed: {:#}", self.node.url, e);
                    if !self.pause(backoff).await {
                        return;
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    /// Seals and broadcasts bundles until cancelled. Every bundle ends as
    /// exactly one `SuccessfulTx` or `FailedTx`, unless the run stops first.
    pub async fn spam(&self, transactions: SharedReceiver<ShallowTransaction>) {
        let cancel = &self.ctx.cancel;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                next = async { transactions.lock().await.recv().await } => next,
            };
            let Some(shallow) = next else {
                return;
            };

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                outcome = self.attach_and_broadcast(shallow) => outcome,
            };

            match outcome {
                Ok(sealed) => {
                    self.ctx.metrics.emit(MetricEvent::SuccessfulTx(SentBundle {
                        transactions: sealed,
                        node: self.node.clone(),
                    }));
                    if let Some(cooldown) = self.ctx.config.cooldown {
                        if !self.pause(cooldown).await {
                            return;
                        }
                    }
                }
                Err(e) => {
                    self.ctx.metrics.emit(MetricEvent::FailedTx);
                    warn!(target: SPAM_RESULT_TARGET, "FAILED {}: {:#}", self.node.url, e);
                }
            }
        }
    }

    async fn attach_and_broadcast(&self, shallow: ShallowTransaction) -> Result<Vec<Transaction>> {
        let config = &self.ctx.config;

        let sealed = if self.node.attach_to_tangle && !config.local_pow {
            debug!("Attaching to tangle via {}", self.node.url);
            self.api
                .attach_to_tangle(&shallow.trunk, &shallow.branch, config.mwm, &shallow.transactions)
                .await
                .context("attachToTangle failed")?
        } else {
            // one local search at a time, process-wide. The guard lives on the
            // blocking thread so a cancelled run keeps it until the search ends.
            let guard = pow_lock().lock().await;
            debug!("Doing PoW for {}", self.node.url);
            let pow = Arc::clone(&self.ctx.pow);
            let mwm = config.mwm;
            tokio::task::spawn_blocking(move || {
                let _guard = guard;
                seal_bundle(
                    &shallow.trunk,
                    &shallow.branch,
                    shallow.transactions,
                    mwm,
                    pow.as_ref(),
                )
            })
            .await
            .context("PoW task failed")??
        };

        if sealed.is_empty() {
            bail!("{} returned an empty bundle", self.node.url);
        }

        self.api
            .broadcast_transactions(&sealed)
            .await
            .context("broadcastTransactions failed")?;
        Ok(sealed)
    }

    /// Sleeps unless cancelled first. Returns false on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
