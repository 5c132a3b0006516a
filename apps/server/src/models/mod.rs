//! Domain models for requests and the operation catalog

pub mod ids;
pub mod operation;
pub mod request;
pub mod update;

pub use ids::{OperationId, RequestId, UserId};
pub use operation::{NewOperation, Operation, OperationFilter, OperationPatch, OperationStatus};
pub use request::{
    Completion, CompletionItem, DetailItem, DraftSummary, ItemMeasurements, ItemOutcome,
    ItemUpdate, ListFilter, LossSource, PatientMetrics, Request, RequestDetail, RequestItem,
    RequestStatus,
};
pub use update::FieldUpdate;
