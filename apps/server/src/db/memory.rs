//! In-process store with the same conditional-write semantics as Postgres
//!
//! All state sits behind one async mutex, so every call is trivially
//! linearizable. A transaction holds the lock for its whole lifetime and
//! edits a private copy that replaces the shared state on commit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::traits::{OperationCatalog, RequestStore, RequestTransaction};
use crate::{
    models::{
        CompletionItem, DetailItem, ItemMeasurements, ItemUpdate, ListFilter, NewOperation,
        Operation, OperationFilter, OperationId, OperationPatch, OperationStatus, PatientMetrics,
        Request, RequestId, RequestItem, RequestStatus, UserId,
    },
    Error, Result,
};

#[derive(Debug, Clone, Default)]
struct State {
    last_request_id: i64,
    last_operation_id: i64,
    requests: BTreeMap<RequestId, Request>,
    items: BTreeMap<(RequestId, OperationId), ItemMeasurements>,
    operations: BTreeMap<OperationId, Operation>,
}

impl State {
    fn draft_mut(&mut self, id: RequestId) -> Option<&mut Request> {
        self.requests
            .get_mut(&id)
            .filter(|r| r.status == RequestStatus::Draft)
    }

    fn item_keys(&self, id: RequestId) -> impl Iterator<Item = &(RequestId, OperationId)> {
        self.items
            .range((id, OperationId(i64::MIN))..=(id, OperationId(i64::MAX)))
            .map(|(key, _)| key)
    }

    fn count_items(&self, id: RequestId) -> i64 {
        self.item_keys(id).count() as i64
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_newest_first(mut requests: Vec<Request>) -> Vec<Request> {
    requests.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    requests
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn get(&self, id: RequestId) -> Result<Option<Request>> {
        Ok(self.state.lock().await.requests.get(&id).cloned())
    }

    async fn items(&self, id: RequestId) -> Result<Vec<DetailItem>> {
        let state = self.state.lock().await;
        state
            .items
            .range((id, OperationId(i64::MIN))..=(id, OperationId(i64::MAX)))
            .map(|((_, operation_id), measurements)| -> Result<DetailItem> {
                let operation = state.operations.get(operation_id).ok_or_else(|| {
                    Error::Internal(format!("item references unknown operation {operation_id}"))
                })?;
                Ok(DetailItem {
                    operation_id: *operation_id,
                    title: operation.title.clone(),
                    image_url: operation.image_url.clone(),
                    blood_loss_coeff: operation.blood_loss_coeff,
                    avg_blood_loss: operation.avg_blood_loss,
                    measurements: *measurements,
                })
            })
            .collect()
    }

    async fn item(&self, id: RequestId, operation_id: OperationId) -> Result<Option<RequestItem>> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .get(&(id, operation_id))
            .map(|measurements| RequestItem {
                request_id: id,
                operation_id,
                measurements: *measurements,
            }))
    }

    async fn count_items(&self, id: RequestId) -> Result<i64> {
        Ok(self.state.lock().await.count_items(id))
    }

    async fn current_draft(&self, creator_id: UserId) -> Result<Option<Request>> {
        let state = self.state.lock().await;
        Ok(state
            .requests
            .values()
            .find(|r| r.creator_id == creator_id && r.status == RequestStatus::Draft)
            .cloned())
    }

    async fn create_draft(&self, creator_id: UserId, at: DateTime<Utc>) -> Result<Request> {
        let mut state = self.state.lock().await;
        let exists = state
            .requests
            .values()
            .any(|r| r.creator_id == creator_id && r.status == RequestStatus::Draft);
        if exists {
            return Err(Error::Conflict(format!(
                "user {creator_id} already has a draft"
            )));
        }

        state.last_request_id += 1;
        let request = Request {
            id: RequestId(state.last_request_id),
            status: RequestStatus::Draft,
            creator_id,
            created_at: at,
            formed_at: None,
            completed_at: None,
            moderator_id: None,
            patient_height_cm: None,
            patient_weight_kg: None,
        };
        state.requests.insert(request.id, request.clone());
        Ok(request)
    }

    async fn update_patient_metrics(
        &self,
        id: RequestId,
        metrics: PatientMetrics,
    ) -> Result<Option<Request>> {
        let mut state = self.state.lock().await;
        let Some(request) = state
            .requests
            .get_mut(&id)
            .filter(|r| matches!(r.status, RequestStatus::Draft | RequestStatus::Formed))
        else {
            return Ok(None);
        };
        let merged = request.patient().merged(metrics);
        request.patient_height_cm = merged.height_cm;
        request.patient_weight_kg = merged.weight_kg;
        Ok(Some(request.clone()))
    }

    async fn insert_item(
        &self,
        id: RequestId,
        operation_id: OperationId,
        measurements: ItemMeasurements,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.draft_mut(id).is_none() {
            return Ok(false);
        }
        if !state.operations.contains_key(&operation_id) {
            return Err(Error::NotFound("operation".to_string()));
        }
        if state.items.contains_key(&(id, operation_id)) {
            return Err(Error::Conflict(format!(
                "operation {operation_id} is already part of request {id}"
            )));
        }
        state.items.insert((id, operation_id), measurements);
        Ok(true)
    }

    async fn update_item(
        &self,
        id: RequestId,
        operation_id: OperationId,
        update: &ItemUpdate,
    ) -> Result<Option<RequestItem>> {
        let mut state = self.state.lock().await;
        if state.draft_mut(id).is_none() {
            return Ok(None);
        }
        let Some(measurements) = state.items.get_mut(&(id, operation_id)) else {
            return Ok(None);
        };
        *measurements = update.apply_to(*measurements);
        Ok(Some(RequestItem {
            request_id: id,
            operation_id,
            measurements: *measurements,
        }))
    }

    async fn remove_item(&self, id: RequestId, operation_id: OperationId) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.draft_mut(id).is_none() {
            return Ok(false);
        }
        Ok(state.items.remove(&(id, operation_id)).is_some())
    }

    async fn mark_formed(&self, id: RequestId, at: DateTime<Utc>) -> Result<Option<Request>> {
        let mut state = self.state.lock().await;
        let has_items = state.count_items(id) > 0;
        let Some(request) = state.draft_mut(id) else {
            return Ok(None);
        };
        if !has_items || !request.patient().missing().is_empty() {
            return Ok(None);
        }
        request.status = RequestStatus::Formed;
        request.formed_at = Some(at);
        Ok(Some(request.clone()))
    }

    async fn mark_deleted(&self, id: RequestId) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.requests.get_mut(&id) {
            Some(request) => {
                request.status = RequestStatus::Deleted;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_for_creator(
        &self,
        creator_id: UserId,
        filter: &ListFilter,
    ) -> Result<Vec<Request>> {
        let state = self.state.lock().await;
        let requests = state
            .requests
            .values()
            .filter(|r| r.creator_id == creator_id && r.status != RequestStatus::Deleted)
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .filter(|r| filter.in_window(Some(r.created_at)))
            .cloned()
            .collect();
        Ok(sorted_newest_first(requests))
    }

    async fn list_all(&self, filter: &ListFilter, include_all: bool) -> Result<Vec<Request>> {
        let state = self.state.lock().await;
        let requests = state
            .requests
            .values()
            .filter(|r| {
                include_all || !matches!(r.status, RequestStatus::Draft | RequestStatus::Deleted)
            })
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .filter(|r| filter.in_window(r.formed_at))
            .cloned()
            .collect();
        Ok(sorted_newest_first(requests))
    }

    async fn begin(&self) -> Result<Box<dyn RequestTransaction>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction { guard, working }))
    }
}

pub struct MemoryTransaction {
    guard: OwnedMutexGuard<State>,
    working: State,
}

#[async_trait]
impl RequestTransaction for MemoryTransaction {
    async fn lock_request(&mut self, id: RequestId) -> Result<Option<Request>> {
        Ok(self.working.requests.get(&id).cloned())
    }

    async fn completion_items(&mut self, id: RequestId) -> Result<Vec<CompletionItem>> {
        let state = &self.working;
        state
            .items
            .range((id, OperationId(i64::MIN))..=(id, OperationId(i64::MAX)))
            .map(|((_, operation_id), measurements)| -> Result<CompletionItem> {
                let operation = state.operations.get(operation_id).ok_or_else(|| {
                    Error::Internal(format!("item references unknown operation {operation_id}"))
                })?;
                Ok(CompletionItem {
                    operation_id: *operation_id,
                    measurements: *measurements,
                    blood_loss_coeff: operation.blood_loss_coeff,
                    avg_blood_loss: operation.avg_blood_loss,
                })
            })
            .collect()
    }

    async fn set_item_total(
        &mut self,
        id: RequestId,
        operation_id: OperationId,
        total_ml: i32,
    ) -> Result<bool> {
        match self.working.items.get_mut(&(id, operation_id)) {
            Some(item) if item.total_blood_loss_ml.is_none() => {
                item.total_blood_loss_ml = Some(total_ml);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_completed(
        &mut self,
        id: RequestId,
        moderator_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<Option<Request>> {
        let Some(request) = self
            .working
            .requests
            .get_mut(&id)
            .filter(|r| r.status == RequestStatus::Formed)
        else {
            return Ok(None);
        };
        request.status = RequestStatus::Completed;
        request.completed_at = Some(at);
        request.moderator_id = Some(moderator_id);
        Ok(Some(request.clone()))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl OperationCatalog for MemoryStore {
    async fn get(&self, id: OperationId) -> Result<Option<Operation>> {
        Ok(self.state.lock().await.operations.get(&id).cloned())
    }

    async fn list(&self, filter: &OperationFilter) -> Result<Vec<Operation>> {
        let state = self.state.lock().await;
        Ok(state
            .operations
            .values()
            .filter(|op| filter.matches(op))
            .cloned()
            .collect())
    }

    async fn create(&self, operation: NewOperation) -> Result<Operation> {
        let mut state = self.state.lock().await;
        state.last_operation_id += 1;
        let created = Operation {
            id: OperationId(state.last_operation_id),
            title: operation.title,
            description: operation.description,
            status: OperationStatus::Active,
            image_url: operation.image_url,
            blood_loss_coeff: operation.blood_loss_coeff,
            avg_blood_loss: operation.avg_blood_loss,
        };
        state.operations.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update(&self, id: OperationId, patch: &OperationPatch) -> Result<Option<Operation>> {
        let mut state = self.state.lock().await;
        let Some(current) = state.operations.get_mut(&id) else {
            return Ok(None);
        };
        *current = patch.apply_to(current.clone());
        Ok(Some(current.clone()))
    }

    async fn archive(&self, id: OperationId) -> Result<Option<Operation>> {
        let mut state = self.state.lock().await;
        Ok(state.operations.get_mut(&id).map(|op| {
            op.status = OperationStatus::Archived;
            op.clone()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_operation() -> (MemoryStore, OperationId) {
        let store = MemoryStore::new();
        let op = OperationCatalog::create(
            &store,
            NewOperation {
                title: "Cholecystectomy".to_string(),
                description: None,
                image_url: None,
                blood_loss_coeff: 0.1,
                avg_blood_loss: 200,
            },
        )
        .await
        .unwrap();
        (store, op.id)
    }

    #[tokio::test]
    async fn second_draft_for_same_creator_conflicts() {
        let store = MemoryStore::new();
        store.create_draft(UserId(7), Utc::now()).await.unwrap();
        let err = store.create_draft(UserId(7), Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        store.create_draft(UserId(8), Utc::now()).await.unwrap();
    }

    #[tokio::test]
    async fn items_only_change_while_draft() {
        let (store, op) = store_with_operation().await;
        let draft = store.create_draft(UserId(1), Utc::now()).await.unwrap();
        assert!(store
            .insert_item(draft.id, op, ItemMeasurements::default())
            .await
            .unwrap());

        store.mark_deleted(draft.id).await.unwrap();
        assert!(!store.remove_item(draft.id, op).await.unwrap());
        assert_eq!(store.count_items(draft.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn uncommitted_transaction_leaves_state_untouched() {
        let (store, op) = store_with_operation().await;
        let draft = store.create_draft(UserId(1), Utc::now()).await.unwrap();
        store
            .insert_item(draft.id, op, ItemMeasurements::default())
            .await
            .unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            assert!(tx.set_item_total(draft.id, op, 500).await.unwrap());
        }

        let item = store.item(draft.id, op).await.unwrap().unwrap();
        assert_eq!(item.measurements.total_blood_loss_ml, None);
    }

    #[tokio::test]
    async fn set_item_total_never_overwrites() {
        let (store, op) = store_with_operation().await;
        let draft = store.create_draft(UserId(1), Utc::now()).await.unwrap();
        store
            .insert_item(
                draft.id,
                op,
                ItemMeasurements {
                    total_blood_loss_ml: Some(300),
                    ..ItemMeasurements::default()
                },
            )
            .await
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(!tx.set_item_total(draft.id, op, 999).await.unwrap());
        tx.commit().await.unwrap();

        let item = store.item(draft.id, op).await.unwrap().unwrap();
        assert_eq!(item.measurements.total_blood_loss_ml, Some(300));
    }
}
