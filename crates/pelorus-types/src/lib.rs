mod alerts;
mod metrics;
mod runs;
mod sla;
mod status;
mod tickets;

pub use alerts::{Alert, AlertKind, AlertSeverity};
pub use metrics::{ComponentStatus, DeviceStatus, VesselMetrics};
pub use runs::{RetryStatistics, RunStatus, SchedulerRun, SchedulerRunDetails, VesselQueryResult};
pub use sla::{SlaStatus, ViolationRecord};
pub use status::{ComponentKind, OperationalStatus};
pub use tickets::{
    format_duration, ApprovalRequest, ApprovalState, IssueSeverity, IssueSummary, TicketLifecycle,
    TicketRecord, TrackerStatus, TrackerTicket,
};
