//! Request lifecycle
//!
//! Owns the `Draft → Formed → Completed` state machine (plus logical delete)
//! over a [`RequestStore`]. Rules:
//! - every transition is a conditional write; a caller that loses a race
//!   observes `InvalidState`
//! - item edits and Form belong to the creator; metrics, delete and detail
//!   also accept moderators
//! - completion runs in one store transaction and never recomputes an item
//!   whose total is already set
//! - each public operation is bounded by the configured timeout

use chrono::Utc;
use hemocalc_engine::EstimateInput;
use std::{future::Future, sync::Arc, time::Duration, time::Instant};

use crate::{
    db::{OperationCatalog, RequestStore},
    metrics,
    models::{
        Completion, CompletionItem, DraftSummary, ItemMeasurements, ItemOutcome, ItemUpdate,
        ListFilter, LossSource, OperationId, OperationStatus, PatientMetrics, Request,
        RequestDetail, RequestId, RequestItem, RequestStatus, UserId,
    },
    Error, Result,
};

/// Resolved identity of whoever invokes a lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: UserId,
    pub is_moderator: bool,
}

impl Caller {
    pub fn user(user_id: UserId) -> Self {
        Self {
            user_id,
            is_moderator: false,
        }
    }

    pub fn moderator(user_id: UserId) -> Self {
        Self {
            user_id,
            is_moderator: true,
        }
    }
}

pub struct RequestLifecycle {
    store: Arc<dyn RequestStore>,
    catalog: Arc<dyn OperationCatalog>,
    timeout: Duration,
}

impl RequestLifecycle {
    pub fn new(
        store: Arc<dyn RequestStore>,
        catalog: Arc<dyn OperationCatalog>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            catalog,
            timeout,
        }
    }

    /// Return the creator's draft, creating it if none exists.
    pub async fn ensure_draft(&self, creator_id: UserId) -> Result<Request> {
        self.bounded("ensure_draft", self.ensure_draft_inner(creator_id))
            .await
    }

    pub async fn set_patient_metrics(
        &self,
        id: RequestId,
        caller: Caller,
        metrics: PatientMetrics,
    ) -> Result<Request> {
        self.bounded(
            "set_patient_metrics",
            self.set_patient_metrics_inner(id, caller, metrics),
        )
        .await
    }

    pub async fn add_item(
        &self,
        id: RequestId,
        caller: Caller,
        operation_id: OperationId,
        measurements: ItemMeasurements,
    ) -> Result<RequestItem> {
        self.bounded(
            "add_item",
            self.add_item_inner(id, caller, operation_id, measurements),
        )
        .await
    }

    pub async fn update_item(
        &self,
        id: RequestId,
        caller: Caller,
        operation_id: OperationId,
        update: ItemUpdate,
    ) -> Result<RequestItem> {
        self.bounded(
            "update_item",
            self.update_item_inner(id, caller, operation_id, update),
        )
        .await
    }

    pub async fn remove_item(
        &self,
        id: RequestId,
        caller: Caller,
        operation_id: OperationId,
    ) -> Result<()> {
        self.bounded(
            "remove_item",
            self.remove_item_inner(id, caller, operation_id),
        )
        .await
    }

    /// `Draft → Formed`, by the creator only.
    pub async fn form(&self, id: RequestId, caller_id: UserId) -> Result<Request> {
        self.bounded("form", self.form_inner(id, caller_id)).await
    }

    /// `Formed → Completed`. The moderator role is asserted by the caller.
    pub async fn complete(&self, id: RequestId, moderator_id: UserId) -> Result<Completion> {
        self.bounded("complete", self.complete_inner(id, moderator_id))
            .await
    }

    /// Logical delete; succeeds from any status.
    pub async fn delete(&self, id: RequestId, caller: Caller) -> Result<()> {
        self.bounded("delete", self.delete_inner(id, caller)).await
    }

    pub async fn list_for_user(
        &self,
        creator_id: UserId,
        filter: &ListFilter,
    ) -> Result<Vec<Request>> {
        self.bounded(
            "list_for_user",
            self.store.list_for_creator(creator_id, filter),
        )
        .await
    }

    pub async fn list_all(&self, filter: &ListFilter, include_all: bool) -> Result<Vec<Request>> {
        self.bounded("list_all", self.store.list_all(filter, include_all))
            .await
    }

    /// Add an operation to the caller's draft, creating the draft on demand
    /// and optionally recording patient metrics first.
    pub async fn add_to_draft(
        &self,
        caller: Caller,
        operation_id: OperationId,
        measurements: ItemMeasurements,
        metrics: PatientMetrics,
    ) -> Result<(Request, RequestItem)> {
        self.bounded("add_to_draft", async {
            let mut draft = self.ensure_draft_inner(caller.user_id).await?;
            if !metrics.is_empty() {
                draft = self
                    .set_patient_metrics_inner(draft.id, caller, metrics)
                    .await?;
            }
            let item = self
                .add_item_inner(draft.id, caller, operation_id, measurements)
                .await?;
            Ok((draft, item))
        })
        .await
    }

    pub async fn detail(&self, id: RequestId, caller: Caller) -> Result<RequestDetail> {
        self.bounded("detail", async {
            let request = self.load(id).await?;
            ensure_owner_or_moderator(&request, caller)?;
            let items = self.store.items(id).await?;
            let calculated_count = (request.status == RequestStatus::Completed).then(|| {
                items
                    .iter()
                    .filter(|item| item.measurements.total_blood_loss_ml.is_some())
                    .count()
            });
            Ok(RequestDetail {
                request,
                items,
                calculated_count,
            })
        })
        .await
    }

    pub async fn draft_summary(&self, creator_id: UserId) -> Result<DraftSummary> {
        self.bounded("draft_summary", async {
            match self.store.current_draft(creator_id).await? {
                Some(draft) => Ok(DraftSummary {
                    current_request_id: Some(draft.id),
                    item_count: self.store.count_items(draft.id).await?,
                }),
                None => Ok(DraftSummary {
                    current_request_id: None,
                    item_count: 0,
                }),
            }
        })
        .await
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(operation, timeout = ?self.timeout, "Lifecycle operation timed out");
                Err(Error::Unavailable(format!(
                    "{operation} did not finish within {:?}",
                    self.timeout
                )))
            }
        };
        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.kind(),
        };
        metrics::record_operation(operation, outcome, start.elapsed().as_secs_f64());
        result
    }

    async fn load(&self, id: RequestId) -> Result<Request> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| Error::request_not_found(id))
    }

    /// Explain why a conditional write on `id` matched nothing.
    async fn rejection(&self, id: RequestId, action: &'static str) -> Error {
        match self.store.get(id).await {
            Ok(Some(request)) if request.status != RequestStatus::Draft => Error::InvalidState {
                id,
                status: request.status,
                action,
            },
            Ok(Some(_)) => Error::Conflict(format!(
                "request {id} changed concurrently; retry {action}"
            )),
            Ok(None) => Error::request_not_found(id),
            Err(err) => err,
        }
    }

    async fn ensure_draft_inner(&self, creator_id: UserId) -> Result<Request> {
        if let Some(draft) = self.store.current_draft(creator_id).await? {
            return Ok(draft);
        }

        match self.store.create_draft(creator_id, Utc::now()).await {
            Ok(draft) => {
                tracing::info!(
                    request_id = %draft.id,
                    creator_id = %creator_id,
                    "Draft created"
                );
                Ok(draft)
            }
            // Lost the race against a concurrent call; its draft is ours too.
            Err(Error::Conflict(_)) => self
                .store
                .current_draft(creator_id)
                .await?
                .ok_or_else(|| {
                    Error::Conflict(format!("draft for user {creator_id} changed concurrently"))
                }),
            Err(err) => Err(err),
        }
    }

    async fn set_patient_metrics_inner(
        &self,
        id: RequestId,
        caller: Caller,
        metrics: PatientMetrics,
    ) -> Result<Request> {
        if metrics.is_empty() {
            return Err(Error::Validation(
                "at least one of patient_height_cm, patient_weight_kg is required".to_string(),
            ));
        }
        validator::Validate::validate(&metrics)?;

        let request = self.load(id).await?;
        ensure_owner_or_moderator(&request, caller)?;
        if request.status.is_terminal() {
            return Err(Error::InvalidState {
                id,
                status: request.status,
                action: "update patient metrics",
            });
        }

        match self.store.update_patient_metrics(id, metrics).await? {
            Some(updated) => Ok(updated),
            None => {
                let current = self.load(id).await?;
                Err(Error::InvalidState {
                    id,
                    status: current.status,
                    action: "update patient metrics",
                })
            }
        }
    }

    async fn add_item_inner(
        &self,
        id: RequestId,
        caller: Caller,
        operation_id: OperationId,
        measurements: ItemMeasurements,
    ) -> Result<RequestItem> {
        validator::Validate::validate(&measurements)?;

        let request = self.load(id).await?;
        ensure_creator(&request, caller.user_id)?;
        require_draft(&request, "add items")?;

        match self.catalog.get(operation_id).await? {
            Some(op) if op.status == OperationStatus::Active => {}
            _ => return Err(Error::NotFound(format!("operation {operation_id}"))),
        }

        if !self
            .store
            .insert_item(id, operation_id, measurements)
            .await?
        {
            return Err(self.rejection(id, "add items").await);
        }

        tracing::debug!(request_id = %id, operation_id = %operation_id, "Item added");
        Ok(RequestItem {
            request_id: id,
            operation_id,
            measurements,
        })
    }

    async fn update_item_inner(
        &self,
        id: RequestId,
        caller: Caller,
        operation_id: OperationId,
        update: ItemUpdate,
    ) -> Result<RequestItem> {
        if update.is_empty() {
            return Err(Error::Validation(
                "no measurement fields provided".to_string(),
            ));
        }
        update.check().map_err(Error::Validation)?;

        let request = self.load(id).await?;
        ensure_creator(&request, caller.user_id)?;
        require_draft(&request, "update items")?;

        match self.store.update_item(id, operation_id, &update).await? {
            Some(item) => Ok(item),
            None => Err(self.item_rejection(id, operation_id, "update items").await),
        }
    }

    async fn remove_item_inner(
        &self,
        id: RequestId,
        caller: Caller,
        operation_id: OperationId,
    ) -> Result<()> {
        let request = self.load(id).await?;
        ensure_creator(&request, caller.user_id)?;
        require_draft(&request, "remove items")?;

        if self.store.remove_item(id, operation_id).await? {
            tracing::debug!(request_id = %id, operation_id = %operation_id, "Item removed");
            Ok(())
        } else {
            Err(self.item_rejection(id, operation_id, "remove items").await)
        }
    }

    /// Like [`Self::rejection`], but a draft whose item is gone is `NotFound`.
    async fn item_rejection(
        &self,
        id: RequestId,
        operation_id: OperationId,
        action: &'static str,
    ) -> Error {
        match self.rejection(id, action).await {
            Error::Conflict(_) => Error::NotFound(format!(
                "operation {operation_id} in request {id}"
            )),
            other => other,
        }
    }

    async fn form_inner(&self, id: RequestId, caller_id: UserId) -> Result<Request> {
        let request = self.load(id).await?;
        ensure_creator(&request, caller_id)?;
        if let Some(err) = self.form_precondition(&request).await? {
            return Err(err);
        }

        match self.store.mark_formed(id, Utc::now()).await? {
            Some(formed) => {
                log_transition(&formed, RequestStatus::Draft);
                Ok(formed)
            }
            None => {
                let current = self.load(id).await?;
                Err(self
                    .form_precondition(&current)
                    .await?
                    .unwrap_or_else(|| {
                        Error::Conflict(format!("request {id} changed concurrently; retry form"))
                    }))
            }
        }
    }

    /// The error Form would fail with for `request` as it stands, if any.
    async fn form_precondition(&self, request: &Request) -> Result<Option<Error>> {
        if request.status != RequestStatus::Draft {
            return Ok(Some(Error::InvalidState {
                id: request.id,
                status: request.status,
                action: "form",
            }));
        }
        let missing = request.patient().missing();
        if !missing.is_empty() {
            return Ok(Some(Error::PreconditionFailed(format!(
                "missing {}",
                missing.join(", ")
            ))));
        }
        if self.store.count_items(request.id).await? == 0 {
            return Ok(Some(Error::PreconditionFailed(
                "request has no items".to_string(),
            )));
        }
        Ok(None)
    }

    async fn complete_inner(&self, id: RequestId, moderator_id: UserId) -> Result<Completion> {
        let mut tx = self.store.begin().await?;

        let request = tx
            .lock_request(id)
            .await?
            .ok_or_else(|| Error::request_not_found(id))?;
        if request.status != RequestStatus::Formed {
            tx.rollback().await?;
            return Err(Error::InvalidState {
                id,
                status: request.status,
                action: "complete",
            });
        }

        let patient = request.patient();
        let items = tx.completion_items(id).await?;
        let mut outcomes = Vec::with_capacity(items.len());
        let mut total: i64 = 0;

        for item in &items {
            let outcome = resolve_item(&patient, item);
            if outcome.source != LossSource::Manual {
                tx.set_item_total(id, item.operation_id, outcome.total_blood_loss_ml)
                    .await?;
            }
            total += i64::from(outcome.total_blood_loss_ml);
            outcomes.push(outcome);
        }

        let completed = match tx.mark_completed(id, moderator_id, Utc::now()).await? {
            Some(completed) => completed,
            None => {
                tx.rollback().await?;
                return Err(Error::Conflict(format!(
                    "request {id} changed concurrently; retry complete"
                )));
            }
        };
        tx.commit().await?;

        for outcome in &outcomes {
            metrics::record_estimate_source(outcome.source.as_str());
        }
        log_transition(&completed, RequestStatus::Formed);
        tracing::info!(
            request_id = %id,
            moderator_id = %moderator_id,
            items = outcomes.len(),
            total_blood_loss_ml = total,
            "Request completed"
        );

        Ok(Completion {
            request_id: id,
            total_blood_loss_ml: total,
            items: outcomes,
        })
    }

    async fn delete_inner(&self, id: RequestId, caller: Caller) -> Result<()> {
        let request = self.load(id).await?;
        ensure_owner_or_moderator(&request, caller)?;

        if !self.store.mark_deleted(id).await? {
            return Err(Error::request_not_found(id));
        }

        tracing::info!(
            request_id = %id,
            creator_id = %request.creator_id,
            from = %request.status,
            to = %RequestStatus::Deleted,
            "Request transition"
        );
        metrics::record_transition(request.status.as_str(), RequestStatus::Deleted.as_str());
        Ok(())
    }
}

/// Final blood-loss value for one item.
///
/// A manual total wins. Otherwise the Nadler estimate is used when the
/// patient and all three item measurements are present and accepted by the
/// engine; everything else falls back to `coeff × avg`.
pub fn resolve_item(patient: &PatientMetrics, item: &CompletionItem) -> ItemOutcome {
    let m = &item.measurements;
    if let Some(manual) = m.total_blood_loss_ml {
        return ItemOutcome {
            operation_id: item.operation_id,
            total_blood_loss_ml: manual,
            source: LossSource::Manual,
        };
    }

    if let (Some(height_cm), Some(weight_kg), Some(hb_before), Some(hb_after), Some(duration)) = (
        patient.height_cm,
        patient.weight_kg,
        m.hb_before,
        m.hb_after,
        m.surgery_duration_hours,
    ) {
        let input = EstimateInput {
            height_cm,
            weight_kg: f64::from(weight_kg),
            hb_before,
            hb_after,
            duration_hours: duration,
            coeff: item.blood_loss_coeff,
        };
        match hemocalc_engine::estimate(&input) {
            Ok(ml) => {
                return ItemOutcome {
                    operation_id: item.operation_id,
                    total_blood_loss_ml: ml,
                    source: LossSource::Estimated,
                }
            }
            Err(err) => {
                tracing::debug!(
                    operation_id = %item.operation_id,
                    field = err.field(),
                    error = %err,
                    "Estimate rejected, using fallback"
                );
            }
        }
    }

    ItemOutcome {
        operation_id: item.operation_id,
        total_blood_loss_ml: hemocalc_engine::fallback_ml(
            item.blood_loss_coeff,
            item.avg_blood_loss,
        ),
        source: LossSource::Fallback,
    }
}

fn ensure_creator(request: &Request, caller_id: UserId) -> Result<()> {
    if request.creator_id != caller_id {
        return Err(Error::Forbidden(format!(
            "request {} belongs to another user",
            request.id
        )));
    }
    Ok(())
}

fn ensure_owner_or_moderator(request: &Request, caller: Caller) -> Result<()> {
    if caller.is_moderator {
        return Ok(());
    }
    ensure_creator(request, caller.user_id)
}

fn require_draft(request: &Request, action: &'static str) -> Result<()> {
    if request.status != RequestStatus::Draft {
        return Err(Error::InvalidState {
            id: request.id,
            status: request.status,
            action,
        });
    }
    Ok(())
}

fn log_transition(request: &Request, from: RequestStatus) {
    tracing::info!(
        request_id = %request.id,
        creator_id = %request.creator_id,
        from = %from,
        to = %request.status,
        "Request transition"
    );
    metrics::record_transition(from.as_str(), request.status.as_str());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(measurements: ItemMeasurements) -> CompletionItem {
        CompletionItem {
            operation_id: OperationId(1),
            measurements,
            blood_loss_coeff: 0.12,
            avg_blood_loss: 1250,
        }
    }

    fn full() -> ItemMeasurements {
        ItemMeasurements {
            hb_before: Some(140),
            hb_after: Some(120),
            surgery_duration_hours: Some(2.0),
            total_blood_loss_ml: None,
        }
    }

    fn patient() -> PatientMetrics {
        PatientMetrics {
            height_cm: Some(175.0),
            weight_kg: Some(70),
        }
    }

    #[test]
    fn full_measurements_use_the_estimate() {
        let outcome = resolve_item(&patient(), &item(full()));
        assert_eq!(outcome.source, LossSource::Estimated);
        assert_eq!(outcome.total_blood_loss_ml, 854);
    }

    #[test]
    fn manual_total_is_taken_verbatim() {
        let outcome = resolve_item(
            &patient(),
            &item(ItemMeasurements {
                total_blood_loss_ml: Some(42),
                ..full()
            }),
        );
        assert_eq!(outcome.source, LossSource::Manual);
        assert_eq!(outcome.total_blood_loss_ml, 42);
    }

    #[test]
    fn missing_measurement_falls_back() {
        let outcome = resolve_item(
            &patient(),
            &item(ItemMeasurements {
                hb_after: None,
                ..full()
            }),
        );
        assert_eq!(outcome.source, LossSource::Fallback);
        assert_eq!(outcome.total_blood_loss_ml, 150);
    }

    #[test]
    fn missing_patient_metrics_fall_back() {
        let outcome = resolve_item(&PatientMetrics::default(), &item(full()));
        assert_eq!(outcome.source, LossSource::Fallback);
    }

    #[test]
    fn rejected_estimate_falls_back() {
        let outcome = resolve_item(
            &patient(),
            &item(ItemMeasurements {
                hb_after: Some(150),
                ..full()
            }),
        );
        assert_eq!(outcome.source, LossSource::Fallback);
        assert_eq!(outcome.total_blood_loss_ml, 150);
    }
}
