mod db;
mod error;
mod migrations;
mod runs;
mod state;
mod tickets;

pub use db::{ComponentTrendPoint, MonitorStore, ViolationDurationStats};
pub use error::{StoreError, StoreResult};
pub use migrations::{latest_version, Migration};
pub use state::{CleanupReport, RecoveryInfo};
pub use tickets::{LifecycleStatistics, StoredTicket};
