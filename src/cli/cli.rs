use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::services::{DeputySettings, SheriffSettings, SupervisorSettings};

/// procman - distributed process supervisor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CommandArgs {
    #[command(subcommand)]
    pub role: Role,
}

#[derive(Subcommand, Debug)]
pub enum Role {
    /// Run the per-host agent that spawns and supervises processes
    Deputy(DeputyArgs),
    /// Run the coordinator that owns the fleet configuration
    Sheriff(SheriffArgs),
}

#[derive(Args, Debug)]
pub struct DeputyArgs {
    /// Listen port
    #[arg(short, long, env = "PROCMAN_DEPUTY_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Listen address
    #[arg(short = 'a', long, env = "PROCMAN_DEPUTY_ADDRESS", default_value = "0.0.0.0")]
    pub address: String,

    /// Address the Sheriff uses for this Deputy (defaults to localhost:<port>)
    #[arg(long, env = "PROCMAN_ADVERTISE")]
    pub advertise: Option<String>,

    /// Sheriff URL to push status reports to
    #[arg(long, env = "PROCMAN_SHERIFF")]
    pub sheriff: Option<String>,

    /// Fleet document; specs bound to the advertised address are loaded at boot
    #[arg(short, long, env = "PROCMAN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Status report interval in milliseconds
    #[arg(long, env = "PROCMAN_REPORT_INTERVAL_MS", default_value_t = 1000)]
    pub report_interval_ms: u64,

    /// Seconds between SIGTERM and SIGKILL on stop
    #[arg(long, env = "PROCMAN_GRACE_PERIOD_SECS", default_value_t = 5)]
    pub grace_period_secs: u64,

    /// Delay before an automatic restart, in milliseconds
    #[arg(long, env = "PROCMAN_RESTART_DELAY_MS", default_value_t = 1000)]
    pub restart_delay_ms: u64,
}

impl DeputyArgs {
    pub fn settings(&self) -> DeputySettings {
        DeputySettings {
            address: self.address.clone(),
            port: self.port,
            advertise: self
                .advertise
                .clone()
                .unwrap_or_else(|| format!("localhost:{}", self.port)),
            sheriff: self.sheriff.clone(),
            config: self.config.clone(),
            report_interval: Duration::from_millis(self.report_interval_ms.max(1)),
            supervisor: SupervisorSettings {
                grace_period: Duration::from_secs(self.grace_period_secs),
                restart_delay: Duration::from_millis(self.restart_delay_ms),
            },
        }
    }
}

#[derive(Args, Debug)]
pub struct SheriffArgs {
    /// Listen port
    #[arg(short, long, env = "PROCMAN_SHERIFF_PORT", default_value_t = 9000)]
    pub port: u16,

    /// Listen address
    #[arg(short = 'a', long, env = "PROCMAN_SHERIFF_ADDRESS", default_value = "0.0.0.0")]
    pub address: String,

    /// Fleet document, reloaded on SIGHUP
    #[arg(short, long, env = "PROCMAN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Expected Deputy report interval in milliseconds
    #[arg(long, env = "PROCMAN_REPORT_INTERVAL_MS", default_value_t = 1000)]
    pub report_interval_ms: u64,

    /// Missed intervals before a Deputy is DISCONNECTED
    #[arg(long, env = "PROCMAN_LIVENESS_MULTIPLIER", default_value_t = 3)]
    pub liveness_multiplier: u32,

    /// Timeout of a single command sent to a Deputy, in seconds
    #[arg(long, env = "PROCMAN_COMMAND_TIMEOUT_SECS", default_value_t = 15)]
    pub command_timeout_secs: u64,

    /// Only accept pushed reports instead of polling every Deputy
    #[arg(long, env = "PROCMAN_NO_POLL")]
    pub no_poll: bool,
}

impl SheriffArgs {
    pub fn settings(&self) -> SheriffSettings {
        SheriffSettings {
            address: self.address.clone(),
            port: self.port,
            config: self.config.clone(),
            report_interval: Duration::from_millis(self.report_interval_ms.max(1)),
            liveness_multiplier: self.liveness_multiplier.max(1),
            command_timeout: Duration::from_secs(self.command_timeout_secs.max(1)),
            poll: !self.no_poll,
        }
    }
}
