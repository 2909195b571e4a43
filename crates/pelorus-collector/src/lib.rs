mod collector;
mod pipeline;
mod run_log;
mod scheduler;

pub use collector::{CollectionOutcome, CollectorConfig, FanOutCollector};
pub use pipeline::{MonitorPipeline, PipelineError, PipelineReport, TicketEscalator};
pub use run_log::{RunEvent, RunLogger};
pub use scheduler::{DailyScheduler, SchedulerError, SchedulerStatus};
