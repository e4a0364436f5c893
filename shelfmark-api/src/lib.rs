mod client;
mod session;

pub use client::{
    AnnotationRecord, ApiError, ApiErrorClass, ChangeOp, CollectionRecord, EntityKind,
    LibraryClient, PaperRecord, ReconcileOp, ReconcileOutcome, RecordPage,
};
pub use session::{SessionClient, SessionError, SessionToken};
