//! Control and query surface shared by every transport

pub mod error;
pub mod events;
pub mod service;

pub use error::{ErrorCode, ErrorEnvelope, ServiceError};
pub use events::{EventBus, PushEvent, Subscription};
pub use service::{
    validate_subject_id, AlertSummary, Command, CommandAck, DetectionService, DetectionStatus,
    ImportSummary, ProcessResult, ServiceOptions,
};
