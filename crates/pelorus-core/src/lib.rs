mod alerts;
mod config;
pub mod rollup;
mod sla;

pub use alerts::{alert_severity_for, AlertManager, MaintenanceStats};
pub use config::{
    AlertLadder, AppConfig, ChatConfig, ConfigError, SchedulingConfig, SlaParameters,
    TicketPolicy, TrackerConfig, VesselDatabase, WebServerConfig,
};
pub use rollup::{component_status, device_status, fleet_summary, FleetSummary};
pub use sla::{FleetSlaSummary, SlaAnalyzer};
