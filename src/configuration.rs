//! Command-line configuration and validation.

use std::{
    net::{SocketAddr, ToSocketAddrs},
    path::PathBuf,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueEnum};
use thiserror::Error;

use crate::{
    crypto::{HmacKey, KeyError},
    packets::{is_valid_sender_id, SENDER_ID_MAX_LENGTH},
    receiver::CollectorSettings,
    sender::ProbeSettings,
    session::random_sender_id,
    stats::OutputFormat,
};

/// Configuration problems. All of them are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("a key is required (--key or --key-file)")]
    MissingKey,

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("client id {0:?} must be 1 to {SENDER_ID_MAX_LENGTH} ASCII characters")]
    InvalidClientId(String),

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("cannot resolve address {addr}: {reason}")]
    Unresolvable { addr: String, reason: String },
}

/// Verbosity of the logger, unless overridden by `RUST_LOG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "packetloss", version, about, long_about = None)]
pub struct Configuration {
    #[command(subcommand)]
    pub mode: Mode,
    /// Seconds between statistics reports
    #[arg(short = 'u', long, global = true, default_value_t = 600)]
    pub update_time: u64,
    /// Log verbosity
    #[arg(short = 'v', long, global = true, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,
    /// Format of the statistics reports
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Log)]
    pub output_format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Send probes to a collector and measure loss and round-trip time
    Client(ClientArgs),
    /// Acknowledge probes and track per-client loss
    Server(ServerArgs),
}

/// Shared secret, given inline or read from a file.
#[derive(Args, Debug)]
pub struct KeyArgs {
    /// Shared secret passphrase
    #[arg(short, long, conflicts_with = "key_file")]
    pub key: Option<String>,
    /// File holding the shared secret as hex or raw bytes
    #[arg(long)]
    pub key_file: Option<PathBuf>,
}

impl KeyArgs {
    fn validate(&self) -> Result<(), ConfigurationError> {
        match (&self.key, &self.key_file) {
            (None, None) => Err(ConfigurationError::MissingKey),
            (Some(key), _) if key.is_empty() => Err(KeyError::Empty.into()),
            _ => Ok(()),
        }
    }

    pub fn load(&self) -> Result<HmacKey, ConfigurationError> {
        match (&self.key, &self.key_file) {
            (Some(passphrase), _) => Ok(HmacKey::from_passphrase(passphrase)?),
            (None, Some(path)) => Ok(HmacKey::from_file(path)?),
            (None, None) => Err(ConfigurationError::MissingKey),
        }
    }
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Collector address
    #[arg(short, long, default_value = "localhost:6666")]
    pub remote: String,
    #[command(flatten)]
    pub key: KeyArgs,
    /// Identity reported to the collector (random if omitted)
    #[arg(long)]
    pub client_id: Option<String>,
    /// Milliseconds between probes
    #[arg(short, long, default_value_t = 1000)]
    pub probe_interval: u64,
    /// Number of probes to send before exiting
    #[arg(short = 'n', long)]
    pub count: Option<u64>,
}

impl ClientArgs {
    fn validate(&self) -> Result<(), ConfigurationError> {
        self.key.validate()?;
        if let Some(id) = &self.client_id {
            if !is_valid_sender_id(id) {
                return Err(ConfigurationError::InvalidClientId(id.clone()));
            }
        }
        if self.probe_interval == 0 {
            return Err(ConfigurationError::ZeroInterval("probe interval"));
        }
        Ok(())
    }

    /// Resolves the remote address and loads the key.
    pub fn probe_settings(
        &self,
        report_interval: Duration,
    ) -> Result<ProbeSettings, ConfigurationError> {
        Ok(ProbeSettings {
            remote: resolve(&self.remote)?,
            key: self.key.load()?,
            sender_id: self.client_id.clone().unwrap_or_else(random_sender_id),
            probe_interval: Duration::from_millis(self.probe_interval),
            report_interval,
            count: self.count,
        })
    }
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Local address to listen on
    #[arg(short, long, default_value = "0.0.0.0:6666")]
    pub local: String,
    #[command(flatten)]
    pub key: KeyArgs,
    /// Seconds between sweeps for idle clients
    #[arg(long, default_value_t = 60)]
    pub cull_interval: u64,
    /// Seconds of silence after which a client is forgotten
    #[arg(long, default_value_t = 1800)]
    pub idle_timeout: u64,
}

impl ServerArgs {
    fn validate(&self) -> Result<(), ConfigurationError> {
        self.key.validate()?;
        if self.cull_interval == 0 {
            return Err(ConfigurationError::ZeroInterval("cull interval"));
        }
        if self.idle_timeout == 0 {
            return Err(ConfigurationError::ZeroInterval("idle timeout"));
        }
        Ok(())
    }

    /// Resolves the local address and loads the key.
    pub fn collector_settings(
        &self,
        report_interval: Duration,
    ) -> Result<CollectorSettings, ConfigurationError> {
        Ok(CollectorSettings {
            local: resolve(&self.local)?,
            key: self.key.load()?,
            report_interval,
            cull_interval: Duration::from_secs(self.cull_interval),
            idle_timeout: Duration::from_secs(self.idle_timeout),
        })
    }
}

impl Configuration {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.update_time == 0 {
            return Err(ConfigurationError::ZeroInterval("update time"));
        }
        match &self.mode {
            Mode::Client(args) => args.validate(),
            Mode::Server(args) => args.validate(),
        }
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.update_time)
    }
}

/// Resolves `addr`, preferring an IPv4 result.
fn resolve(addr: &str) -> Result<SocketAddr, ConfigurationError> {
    let unresolvable = |reason: String| ConfigurationError::Unresolvable {
        addr: addr.to_string(),
        reason,
    };
    let candidates: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|e| unresolvable(e.to_string()))?
        .collect();

    candidates
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| unresolvable("no addresses found".to_string()))
}
