mod approval;
mod chat;
mod tracker;
mod workflow;

pub use approval::{
    ApprovalError, ApprovalSettings, ApprovalStatistics, ApprovalWorkflow, Decision,
};
pub use chat::{handle_interaction, ChatNotifier, ChatSettings};
pub use tracker::{priority_name, TrackerClient, TrackerConnection, TrackerError};
pub use workflow::{DuplicateRule, SeverityLadder, TicketWorkflow, WorkflowError};
