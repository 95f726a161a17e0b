//! Spammer controller.
//!
//! [`SpammerCtrl`] owns one [`Spammer`] at a time and rebuilds it whenever the
//! node or the hash function changes. Metrics of every spammer it builds are
//! fanned out to registered listeners; a listener that cannot take a metric
//! within one second is dropped and its channel closed.

use anyhow::Result;
use core_logic::{ConfigError, Node, TxStore};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SpammerConfig;
use crate::metrics::Metric;
use crate::node::{Connector, HttpConnector};
use crate::pow::{available_pow_types, best_pow, pow_by_name, PowFn};
use crate::spammer::Spammer;
use crate::ternary::TAG_TRYTES;

pub const DEFAULT_MESSAGE: &str = "DISTRIBUTED9TANGLE9LOAD9GENERATOR";
pub const DEFAULT_TAG: &str = "999DTLG";

const LISTENER_SEND_TIMEOUT: Duration = Duration::from_secs(1);
const START_WAIT: Duration = Duration::from_secs(1);
const ADDRESS_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ9";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusMsg {
    pub running: bool,
    pub node: String,
    pub pow_type: String,
}

/// Construction options. Unset fields fall back to HTTP nodes, the fastest
/// local hash function and no store.
#[derive(Clone, Default)]
pub struct CtrlOptions {
    pub pow: Option<Arc<dyn PowFn>>,
    pub connector: Option<Arc<dyn Connector>>,
    pub store: Option<Arc<TxStore>>,
    pub cooldown: Option<Duration>,
}

struct CtrlState {
    spammer: Arc<Spammer>,
    node_url: String,
    pow: Arc<dyn PowFn>,
    run: Option<JoinHandle<Result<()>>>,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    senders: HashMap<u64, mpsc::Sender<Metric>>,
}

/// Everything needed to build a spammer besides node and hash function.
struct SpammerFactory {
    relay: mpsc::UnboundedSender<Metric>,
    connector: Arc<dyn Connector>,
    store: Option<Arc<TxStore>>,
    cooldown: Option<Duration>,
}

impl SpammerFactory {
    fn build(&self, node_url: &str, pow: &Arc<dyn PowFn>) -> Result<Spammer, ConfigError> {
        let mut builder = SpammerConfig::builder()
            .node(Node::new(node_url, false))
            .destination_address(random_address())
            .tag(default_tag(pow.name()))
            .message(DEFAULT_MESSAGE);
        if let Some(cooldown) = self.cooldown {
            builder = builder.cooldown(cooldown);
        }
        let config = builder.build()?;

        let mut spammer = Spammer::new(config, Arc::clone(pow))
            .with_connector(Arc::clone(&self.connector))
            .with_relay(self.relay.clone());
        if let Some(store) = &self.store {
            spammer = spammer.with_store(Arc::clone(store));
        }
        Ok(spammer)
    }
}

pub struct SpammerCtrl {
    state: Mutex<CtrlState>,
    listeners: Arc<Mutex<Listeners>>,
    factory: SpammerFactory,
    fanout: JoinHandle<()>,
}

/// `999DTLG9<OS>9<POW>`, reduced to the tryte alphabet and 27 trytes.
pub fn default_tag(pow_name: &str) -> String {
    format!("{}9{}9{}", DEFAULT_TAG, std::env::consts::OS, pow_name)
        .to_uppercase()
        .chars()
        .map(|c| if c.is_ascii_uppercase() { c } else { '9' })
        .take(TAG_TRYTES)
        .collect()
}

fn random_address() -> String {
    let mut rng = rand::thread_rng();
    (0..81)
        .map(|_| ADDRESS_ALPHABET[rng.gen_range(0..ADDRESS_ALPHABET.len())] as char)
        .collect()
}

impl SpammerCtrl {
    pub fn new(node_url: &str, options: CtrlOptions) -> Result<Self, ConfigError> {
        let pow = options.pow.unwrap_or_else(best_pow);
        let (relay, relay_rx) = mpsc::unbounded_channel();
        let factory = SpammerFactory {
            relay,
            connector: options
                .connector
                .unwrap_or_else(|| Arc::new(HttpConnector::default())),
            store: options.store,
            cooldown: options.cooldown,
        };
        let spammer = factory.build(node_url, &pow)?;
        info!("Using PoW: {}", pow.name());

        let listeners = Arc::new(Mutex::new(Listeners::default()));
        Ok(Self {
            state: Mutex::new(CtrlState {
                spammer: Arc::new(spammer),
                node_url: node_url.to_string(),
                pow,
                run: None,
            }),
            listeners: Arc::clone(&listeners),
            factory,
            fanout: tokio::spawn(fan_out(relay_rx, listeners)),
        })
    }

    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::start_locked(&mut state).await
    }

    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::stop_locked(&mut state).await
    }

    async fn start_locked(state: &mut CtrlState) -> Result<()> {
        if state.spammer.is_running() {
            return Ok(());
        }
        // reap a run that ended on its own
        if let Some(previous) = state.run.take() {
            if let Ok(Err(e)) = previous.await {
                warn!("Previous run ended with error: {:#}", e);
            }
        }

        let spammer = Arc::clone(&state.spammer);
        let handle = tokio::spawn(async move { spammer.start().await });

        let deadline = Instant::now() + START_WAIT;
        while !state.spammer.is_running() && !handle.is_finished() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        if handle.is_finished() && !state.spammer.is_running() {
            return match handle.await {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("Spammer task failed: {}", e)),
            };
        }
        state.run = Some(handle);
        Ok(())
    }

    async fn stop_locked(state: &mut CtrlState) -> Result<()> {
        state.spammer.stop()?;
        if let Some(run) = state.run.take() {
            match run.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Spammer run ended with error: {:#}", e),
                Err(e) => warn!("Spammer task failed: {}", e),
            }
        }
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.spammer.is_running()
    }

    pub async fn state(&self) -> StatusMsg {
        let state = self.state.lock().await;
        StatusMsg {
            running: state.spammer.is_running(),
            node: state.node_url.clone(),
            pow_type: state.pow.name().to_string(),
        }
    }

    /// The spammer currently owned by the controller.
    pub async fn spammer(&self) -> Arc<Spammer> {
        Arc::clone(&self.state.lock().await.spammer)
    }

    /// Points the spammer at another node, restarting it if it was running.
    pub async fn change_node(&self, node_url: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let pow = Arc::clone(&state.pow);
        let spammer = self.factory.build(node_url, &pow)?;
        state.node_url = node_url.to_string();
        Self::replace_spammer(&mut state, spammer).await
    }

    /// Switches the hash function, restarting the spammer if it was running.
    pub async fn change_pow_type(&self, name: &str) -> Result<()> {
        let pow = pow_by_name(name)?;
        let mut state = self.state.lock().await;
        let node_url = state.node_url.clone();
        let spammer = self.factory.build(&node_url, &pow)?;
        info!("Using PoW: {}", pow.name());
        state.pow = pow;
        Self::replace_spammer(&mut state, spammer).await
    }

    async fn replace_spammer(state: &mut CtrlState, spammer: Spammer) -> Result<()> {
        let was_running = state.spammer.is_running();
        Self::stop_locked(state).await?;
        state.spammer = Arc::new(spammer);
        if was_running {
            Self::start_locked(state).await?;
        }
        Ok(())
    }

    pub fn available_pow_types(&self) -> Vec<&'static str> {
        available_pow_types()
    }

    /// Registers a listener with a buffer of `capacity` metrics.
    pub async fn add_metric_listener(&self, capacity: usize) -> (u64, mpsc::Receiver<Metric>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut listeners = self.listeners.lock().await;
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.senders.insert(id, tx);
        (id, rx)
    }

    /// Removing an unknown id is a no-op.
    pub async fn remove_metric_listener(&self, id: u64) {
        self.listeners.lock().await.senders.remove(&id);
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.lock().await.senders.len()
    }

    #[cfg(test)]
    pub(crate) fn relay(&self) -> &mpsc::UnboundedSender<Metric> {
        &self.factory.relay
    }
}

impl Drop for SpammerCtrl {
    fn drop(&mut self) {
        self.fanout.abort();
    }
}

async fn fan_out(mut metrics: mpsc::UnboundedReceiver<Metric>, listeners: Arc<Mutex<Listeners>>) {
    while let Some(metric) = metrics.recv().await {
        let mut listeners = listeners.lock().await;
        let mut stale = Vec::new();
        for (id, sender) in listeners.senders.iter() {
            if sender
                .send_timeout(metric.clone(), LISTENER_SEND_TIMEOUT)
                .await
                .is_err()
            {
                stale.push(*id);
            }
        }
        for id in stale {
            // dropping the only sender closes the listener's channel
            listeners.senders.remove(&id);
            debug!("Removed unresponsive metric listener {}", id);
        }
    }
}
