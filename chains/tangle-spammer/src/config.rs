//! Configuration for tangle-spammer
//!
//! [`SpammerConfig`] is the validated configuration of one spammer. Build it
//! with [`SpammerConfig::builder`] or load a [`FileConfig`] from TOML. The
//! engine checks the node list again when a run starts.

use anyhow::{Context, Result};
use core_logic::{ConfigError, Node, SecurityLevel};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::pow::MAX_MWM;
use crate::strategy::TipStrategy;
use crate::ternary::{is_trytes, TAG_TRYTES};
use crate::transaction::HASH_TRYTES;

pub const DEFAULT_MWM: u32 = 14;
pub const DEFAULT_DEPTH: u32 = 3;
pub const DEFAULT_CONFIRMATION_INTERVAL: Duration = Duration::from_secs(60);

/// Length of an address with its 9-tryte checksum.
const ADDRESS_WITH_CHECKSUM: usize = HASH_TRYTES + 9;

#[derive(Debug, Clone, PartialEq)]
pub struct SpammerConfig {
    pub nodes: Vec<Node>,
    pub mwm: u32,
    pub depth: u32,
    pub security_level: SecurityLevel,
    /// 81 trytes, checksum stripped.
    pub destination_address: String,
    pub tag: String,
    pub message: String,
    pub strategy: TipStrategy,
    /// Pause of a spam worker after each successful broadcast.
    pub cooldown: Option<Duration>,
    /// Run length; the run stops by itself once it elapses.
    pub timeout: Option<Duration>,
    /// Seal locally even on nodes that offer remote attachment.
    pub local_pow: bool,
    /// Replace the message with the JSON run summary.
    pub message_metrics: bool,
    pub confirmation_interval: Duration,
}

impl SpammerConfig {
    pub fn builder() -> SpammerConfigBuilder {
        SpammerConfigBuilder::default()
    }
}

#[derive(Debug, Clone)]
pub struct SpammerConfigBuilder {
    nodes: Vec<Node>,
    mwm: u32,
    depth: u32,
    security_level: SecurityLevel,
    destination_address: Option<String>,
    tag: String,
    message: String,
    strategy: TipStrategy,
    cooldown: Option<Duration>,
    timeout: Option<Duration>,
    local_pow: bool,
    message_metrics: bool,
    confirmation_interval: Duration,
}

impl Default for SpammerConfigBuilder {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            mwm: DEFAULT_MWM,
            depth: DEFAULT_DEPTH,
            security_level: SecurityLevel::default(),
            destination_address: None,
            tag: String::new(),
            message: String::new(),
            strategy: TipStrategy::default(),
            cooldown: None,
            timeout: None,
            local_pow: false,
            message_metrics: false,
            confirmation_interval: DEFAULT_CONFIRMATION_INTERVAL,
        }
    }
}

impl SpammerConfigBuilder {
    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn nodes(mut self, nodes: impl IntoIterator<Item = Node>) -> Self {
        self.nodes.extend(nodes);
        self
    }

    pub fn mwm(mut self, mwm: u32) -> Self {
        self.mwm = mwm;
        self
    }

    pub fn depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn security_level(mut self, level: SecurityLevel) -> Self {
        self.security_level = level;
        self
    }

    pub fn destination_address(mut self, address: impl Into<String>) -> Self {
        self.destination_address = Some(address.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn strategy(mut self, strategy: TipStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = (!cooldown.is_zero()).then_some(cooldown);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn local_pow(mut self, local_pow: bool) -> Self {
        self.local_pow = local_pow;
        self
    }

    pub fn message_metrics(mut self, enabled: bool) -> Self {
        self.message_metrics = enabled;
        self
    }

    pub fn confirmation_interval(mut self, interval: Duration) -> Self {
        self.confirmation_interval = interval;
        self
    }

    pub fn build(self) -> Result<SpammerConfig, ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::MissingField {
                field: "nodes".to_string(),
            });
        }
        for node in &self.nodes {
            url::Url::parse(&node.url).map_err(|_| ConfigError::InvalidNodeUrl {
                url: node.url.clone(),
            })?;
        }

        if self.mwm == 0 || self.mwm > MAX_MWM {
            return Err(ConfigError::InvalidValue {
                field: "mwm".to_string(),
                reason: format!("must be within 1..={}", MAX_MWM),
            });
        }
        if self.depth == 0 {
            return Err(ConfigError::InvalidValue {
                field: "depth".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.confirmation_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "confirmation_interval".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        let address = self
            .destination_address
            .ok_or_else(|| ConfigError::MissingField {
                field: "destination_address".to_string(),
            })?;
        let destination_address = normalize_address(&address)?;

        if self.tag.len() > TAG_TRYTES || !is_trytes(&self.tag) {
            return Err(ConfigError::InvalidTrytes {
                field: "tag".to_string(),
                value: self.tag,
            });
        }
        if !is_trytes(&self.message) {
            return Err(ConfigError::InvalidTrytes {
                field: "message".to_string(),
                value: self.message,
            });
        }

        Ok(SpammerConfig {
            nodes: self.nodes,
            mwm: self.mwm,
            depth: self.depth,
            security_level: self.security_level,
            destination_address,
            tag: self.tag,
            message: self.message,
            strategy: self.strategy,
            cooldown: self.cooldown,
            timeout: self.timeout,
            local_pow: self.local_pow,
            message_metrics: self.message_metrics,
            confirmation_interval: self.confirmation_interval,
        })
    }
}

/// Accepts 81-tryte addresses and 90-tryte addresses with checksum.
fn normalize_address(address: &str) -> Result<String, ConfigError> {
    let invalid = || ConfigError::InvalidTrytes {
        field: "destination_address".to_string(),
        value: address.to_string(),
    };
    if !is_trytes(address) {
        return Err(invalid());
    }
    match address.len() {
        HASH_TRYTES => Ok(address.to_string()),
        ADDRESS_WITH_CHECKSUM => Ok(address[..HASH_TRYTES].to_string()),
        _ => Err(invalid()),
    }
}

/// On-disk configuration (TOML).
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default = "default_mwm")]
    pub mwm: u32,
    #[serde(default = "default_depth")]
    pub depth: u32,
    #[serde(default)]
    pub security_level: SecurityLevel,
    /// Random when absent.
    pub destination_address: Option<String>,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub cooldown_ms: u64,
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default)]
    pub local_pow: bool,
    #[serde(default)]
    pub message_metrics: bool,
    #[serde(default = "default_confirmation_interval_secs")]
    pub confirmation_interval_secs: u64,
    /// Hash function name, see `available_pow_types`.
    pub pow: Option<String>,
    /// SQLite file for the transaction store.
    pub database: Option<String>,
    #[serde(default)]
    pub verbose: bool,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            mwm: DEFAULT_MWM,
            depth: DEFAULT_DEPTH,
            security_level: SecurityLevel::default(),
            destination_address: None,
            tag: String::new(),
            message: String::new(),
            strategy: String::new(),
            cooldown_ms: 0,
            timeout_secs: 0,
            local_pow: false,
            message_metrics: false,
            confirmation_interval_secs: default_confirmation_interval_secs(),
            pow: None,
            database: None,
            verbose: false,
        }
    }
}

fn default_mwm() -> u32 {
    DEFAULT_MWM
}

fn default_depth() -> u32 {
    DEFAULT_DEPTH
}

fn default_confirmation_interval_secs() -> u64 {
    DEFAULT_CONFIRMATION_INTERVAL.as_secs()
}

impl FileConfig {
    /// Load configuration from a TOML file
    ///
    /// # Example
    /// ```ignore
    /// let config = FileConfig::from_path("config/config.toml")?;
    /// ```
    pub fn from_path(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::FileNotFound {
                path: path.to_string(),
            },
            _ => ConfigError::IoError {
                path: path.to_string(),
                msg: e.to_string(),
            },
        })?;
        let config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_string(),
            msg: e.to_string(),
        })?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config TOML")
    }

    pub fn into_spammer_config(self, fallback_address: &str) -> Result<SpammerConfig, ConfigError> {
        let strategy = self.strategy.parse::<TipStrategy>()?;
        SpammerConfig::builder()
            .nodes(self.nodes)
            .mwm(self.mwm)
            .depth(self.depth)
            .security_level(self.security_level)
            .destination_address(
                self.destination_address
                    .unwrap_or_else(|| fallback_address.to_string()),
            )
            .tag(self.tag)
            .message(self.message)
            .strategy(strategy)
            .cooldown(Duration::from_millis(self.cooldown_ms))
            .timeout(Duration::from_secs(self.timeout_secs))
            .local_pow(self.local_pow)
            .message_metrics(self.message_metrics)
            .confirmation_interval(Duration::from_secs(self.confirmation_interval_secs))
            .build()
    }
}
