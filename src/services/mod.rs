pub mod deputy;
pub mod deputy_client;
pub mod fleet;
pub mod runner;
pub mod sheriff;
pub mod stats_collector;
pub mod supervisor;

pub use deputy::{Deputy, DeputySettings};
pub use deputy_client::HttpDeputyClient;
pub use fleet::IngestOutcome;
pub use sheriff::{Sheriff, SheriffSettings};
pub use stats_collector::StatsCollector;
pub use supervisor::SupervisorSettings;
