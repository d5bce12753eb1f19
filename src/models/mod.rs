pub mod company;
pub mod job;
pub mod session;

pub use company::{
    Address, AttemptDetail, CompanyDoc, EnrichField, IncompleteReason, MissingReason, Provenance,
    Review, ReviewCursor, SourceKind, StageStatus,
};
pub use job::{ImportJob, JobState, RequestPayload, JOB_PARTITION};
pub use session::{ImportSession, SessionStatus};
