pub mod audit;
pub mod backoff;
pub mod business_hours;
pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;
pub mod lead_queue;
pub mod orchestrator;
pub mod ports;

pub use audit::{verify_history, HistoryViolation, TransitionRecord};
pub use business_hours::BusinessHours;
pub use domain::call::{CallAttempt, CallAttemptId, CallFailure, CallState, FailureKind};
pub use domain::lead::{Lead, LeadId, LeadStatus, PhoneNumber, RawLead};
pub use domain::qualification::{MeetingSlot, QualificationResult, QualificationVerdict};
pub use domain::transcript::{Intent, Speaker, Transcript, Turn};
pub use errors::{ApplicationError, DomainError, ErrorClass, InterfaceError};
pub use flows::{CallAction, CallEvent, CallFlowEngine, CallTransitionError};
pub use lead_queue::{IngestReport, LeadQueue, LeadQueuePolicy};
pub use orchestrator::{Command, InFlightCall, Orchestrator, OrchestratorConfig, Step};
pub use ports::{
    CollaboratorError, LeadSource, MeetingRequest, PlaceCallRequest, SchedulingService,
    TelephonyProvider, TelephonyStatus,
};
