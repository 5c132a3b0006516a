//! Storage contracts for requests and the operation catalog
//!
//! Every mutating call is a conditional write: the store applies it only when
//! the row is in the expected state and reports "nothing matched" otherwise.
//! Diagnosing *why* nothing matched (missing row, wrong status, missing data)
//! is left to the lifecycle, which re-reads the request.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    models::{
        CompletionItem, DetailItem, ItemMeasurements, ItemUpdate, ListFilter, NewOperation,
        Operation, OperationFilter, OperationId, OperationPatch, PatientMetrics, Request,
        RequestId, RequestItem, UserId,
    },
    Result,
};

/// Persistence for requests and their items.
///
/// Implementations must uphold the uniqueness invariants themselves:
/// at most one draft per creator and at most one item per
/// `(request, operation)` pair. Violations surface as [`crate::Error::Conflict`].
#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn get(&self, id: RequestId) -> Result<Option<Request>>;

    /// Items joined with their catalog entry, ordered by operation id.
    async fn items(&self, id: RequestId) -> Result<Vec<DetailItem>>;

    async fn item(&self, id: RequestId, operation_id: OperationId) -> Result<Option<RequestItem>>;

    async fn count_items(&self, id: RequestId) -> Result<i64>;

    async fn current_draft(&self, creator_id: UserId) -> Result<Option<Request>>;

    /// Insert a fresh draft.
    ///
    /// # Errors
    /// * `Conflict` - the creator already has a draft
    async fn create_draft(&self, creator_id: UserId, at: DateTime<Utc>) -> Result<Request>;

    /// Overlay the provided metrics while the request is Draft or Formed.
    ///
    /// Returns `None` when no such request is in an editable state.
    async fn update_patient_metrics(
        &self,
        id: RequestId,
        metrics: PatientMetrics,
    ) -> Result<Option<Request>>;

    /// Insert an item while the request is Draft. Returns `false` when the
    /// request is missing or not a draft.
    ///
    /// # Errors
    /// * `Conflict` - an item for this operation already exists
    async fn insert_item(
        &self,
        id: RequestId,
        operation_id: OperationId,
        measurements: ItemMeasurements,
    ) -> Result<bool>;

    /// Apply a partial update while the request is Draft.
    ///
    /// Returns `None` when the item is missing or the request is not a draft.
    async fn update_item(
        &self,
        id: RequestId,
        operation_id: OperationId,
        update: &ItemUpdate,
    ) -> Result<Option<RequestItem>>;

    /// Remove an item while the request is Draft.
    async fn remove_item(&self, id: RequestId, operation_id: OperationId) -> Result<bool>;

    /// `Draft → Formed`, guarded by the form preconditions (height, weight,
    /// at least one item) in the same statement.
    async fn mark_formed(&self, id: RequestId, at: DateTime<Utc>) -> Result<Option<Request>>;

    /// Logical delete from any status. Returns `false` only for unknown ids.
    async fn mark_deleted(&self, id: RequestId) -> Result<bool>;

    /// A creator's requests, Deleted excluded, filtered on `created_at`.
    async fn list_for_creator(&self, creator_id: UserId, filter: &ListFilter)
        -> Result<Vec<Request>>;

    /// All requests, filtered on `formed_at`. Draft and Deleted are excluded
    /// unless `include_all` is set.
    async fn list_all(&self, filter: &ListFilter, include_all: bool) -> Result<Vec<Request>>;

    async fn begin(&self) -> Result<Box<dyn RequestTransaction>>;
}

/// Unit of work used by completion.
///
/// Dropping a transaction without calling [`RequestTransaction::commit`]
/// discards every write made through it.
#[async_trait]
pub trait RequestTransaction: Send {
    /// Read the request and hold it against concurrent writers until the
    /// transaction ends.
    async fn lock_request(&mut self, id: RequestId) -> Result<Option<Request>>;

    /// Items with the operation coefficient and average read inside this
    /// transaction.
    async fn completion_items(&mut self, id: RequestId) -> Result<Vec<CompletionItem>>;

    /// Persist a computed total unless one is already present.
    async fn set_item_total(
        &mut self,
        id: RequestId,
        operation_id: OperationId,
        total_ml: i32,
    ) -> Result<bool>;

    /// `Formed → Completed`; `None` when the request is no longer Formed.
    async fn mark_completed(
        &mut self,
        id: RequestId,
        moderator_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<Option<Request>>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Operation catalog storage.
#[async_trait]
pub trait OperationCatalog: Send + Sync {
    async fn get(&self, id: OperationId) -> Result<Option<Operation>>;

    /// Matching operations ordered by id.
    async fn list(&self, filter: &OperationFilter) -> Result<Vec<Operation>>;

    async fn create(&self, operation: NewOperation) -> Result<Operation>;

    async fn update(&self, id: OperationId, patch: &OperationPatch) -> Result<Option<Operation>>;

    async fn archive(&self, id: OperationId) -> Result<Option<Operation>>;
}
