//! PostgreSQL implementation of the request and catalog stores
//!
//! Uniqueness invariants live in the schema (see `migrations/`):
//! - `requests_one_draft_per_creator` partial unique index
//! - composite primary key on `request_items`
//!
//! Item writes take a `FOR SHARE` lock on the parent request so they
//! serialize against status transitions, which update that row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryFutureExt as _;
use sqlx::{postgres::PgRow, PgPool, Postgres, Row, Transaction};

use super::{
    retry::{self, RetryPolicy},
    traits::{OperationCatalog, RequestStore, RequestTransaction},
};
use crate::{
    models::{
        CompletionItem, DetailItem, ItemMeasurements, ItemUpdate, ListFilter, NewOperation,
        Operation, OperationFilter, OperationId, OperationPatch, OperationStatus, PatientMetrics,
        Request, RequestId, RequestItem, UserId,
    },
    Error, Result,
};

const REQUEST_COLUMNS: &str = "id, status, creator_id, created_at, formed_at, completed_at, \
     moderator_id, patient_height_cm, patient_weight_kg";

const OPERATION_COLUMNS: &str =
    "id, title, description, status, image_url, blood_loss_coeff, avg_blood_loss";

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PostgresStore {
    pub fn new(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Form under a row lock on the request. The lock waits out in-flight
    /// item writes (they hold `FOR SHARE`), and the item check that follows
    /// runs on a fresh snapshot.
    async fn form_once(&self, id: RequestId, at: DateTime<Utc>) -> Result<Option<Request>> {
        let mut tx = self.pool.begin().await?;

        let ready: Option<bool> = sqlx::query_scalar(
            "SELECT status = 'draft'
                    AND patient_height_cm IS NOT NULL
                    AND patient_weight_kg IS NOT NULL
             FROM requests WHERE id = $1 FOR UPDATE",
        )
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?;
        if ready != Some(true) {
            tx.rollback().await?;
            return Ok(None);
        }

        let has_items: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM request_items WHERE request_id = $1)",
        )
        .bind(id.0)
        .fetch_one(&mut *tx)
        .await?;
        if !has_items {
            tx.rollback().await?;
            return Ok(None);
        }

        let row = sqlx::query(&format!(
            "UPDATE requests SET status = 'formed', formed_at = $2
             WHERE id = $1
             RETURNING {REQUEST_COLUMNS}"
        ))
        .bind(id.0)
        .bind(at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        request_from_row(&row).map(Some)
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Internal(format!("Migration failed: {e}")))?;
        Ok(())
    }
}

fn request_from_row(row: &PgRow) -> Result<Request> {
    let status: String = row.try_get("status")?;
    Ok(Request {
        id: RequestId(row.try_get("id")?),
        status: status.parse().map_err(Error::Internal)?,
        creator_id: UserId(row.try_get("creator_id")?),
        created_at: row.try_get("created_at")?,
        formed_at: row.try_get("formed_at")?,
        completed_at: row.try_get("completed_at")?,
        moderator_id: row.try_get::<Option<i64>, _>("moderator_id")?.map(UserId),
        patient_height_cm: row.try_get("patient_height_cm")?,
        patient_weight_kg: row.try_get("patient_weight_kg")?,
    })
}

fn measurements_from_row(row: &PgRow) -> Result<ItemMeasurements> {
    Ok(ItemMeasurements {
        hb_before: row.try_get("hb_before")?,
        hb_after: row.try_get("hb_after")?,
        surgery_duration_hours: row.try_get("surgery_duration_hours")?,
        total_blood_loss_ml: row.try_get("total_blood_loss_ml")?,
    })
}

fn item_from_row(row: &PgRow) -> Result<RequestItem> {
    Ok(RequestItem {
        request_id: RequestId(row.try_get("request_id")?),
        operation_id: OperationId(row.try_get("operation_id")?),
        measurements: measurements_from_row(row)?,
    })
}

fn operation_from_row(row: &PgRow) -> Result<Operation> {
    let status: String = row.try_get("status")?;
    Ok(Operation {
        id: OperationId(row.try_get("id")?),
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        status: status.parse().map_err(Error::Internal)?,
        image_url: row.try_get("image_url")?,
        blood_loss_coeff: row.try_get("blood_loss_coeff")?,
        avg_blood_loss: row.try_get("avg_blood_loss")?,
    })
}

/// Translate constraint violations into domain errors.
fn map_write_error(err: sqlx::Error, conflict: impl FnOnce() -> String) -> Error {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return Error::Conflict(conflict());
        }
        if db.is_foreign_key_violation() {
            return Error::NotFound("operation".to_string());
        }
    }
    Error::Database(err)
}

#[async_trait]
impl RequestStore for PostgresStore {
    async fn get(&self, id: RequestId) -> Result<Option<Request>> {
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = $1");
        let row = self
            .retry
            .run("request.get", || {
                sqlx::query(&sql)
                    .bind(id.0)
                    .fetch_optional(&self.pool)
                    .map_err(Error::from)
            })
            .await?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn items(&self, id: RequestId) -> Result<Vec<DetailItem>> {
        let rows = self
            .retry
            .run("request.items", || {
                sqlx::query(
                    "SELECT ri.operation_id, o.title, o.image_url, o.blood_loss_coeff, o.avg_blood_loss,
                            ri.hb_before, ri.hb_after, ri.surgery_duration_hours, ri.total_blood_loss_ml
                     FROM request_items ri
                     JOIN operations o ON o.id = ri.operation_id
                     WHERE ri.request_id = $1
                     ORDER BY ri.operation_id",
                )
                .bind(id.0)
                .fetch_all(&self.pool)
                .map_err(Error::from)
            })
            .await?;

        rows.iter()
            .map(|row| -> Result<DetailItem> {
                Ok(DetailItem {
                    operation_id: OperationId(row.try_get("operation_id")?),
                    title: row.try_get("title")?,
                    image_url: row.try_get("image_url")?,
                    blood_loss_coeff: row.try_get("blood_loss_coeff")?,
                    avg_blood_loss: row.try_get("avg_blood_loss")?,
                    measurements: measurements_from_row(row)?,
                })
            })
            .collect()
    }

    async fn item(&self, id: RequestId, operation_id: OperationId) -> Result<Option<RequestItem>> {
        let row = self
            .retry
            .run("request.item", || {
                sqlx::query(
                    "SELECT request_id, operation_id, hb_before, hb_after,
                            surgery_duration_hours, total_blood_loss_ml
                     FROM request_items
                     WHERE request_id = $1 AND operation_id = $2",
                )
                .bind(id.0)
                .bind(operation_id.0)
                .fetch_optional(&self.pool)
                .map_err(Error::from)
            })
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn count_items(&self, id: RequestId) -> Result<i64> {
        self.retry
            .run("request.count_items", || {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM request_items WHERE request_id = $1",
                )
                .bind(id.0)
                .fetch_one(&self.pool)
                .map_err(Error::from)
            })
            .await
    }

    async fn current_draft(&self, creator_id: UserId) -> Result<Option<Request>> {
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM requests WHERE creator_id = $1 AND status = 'draft'"
        );
        let row = self
            .retry
            .run("request.current_draft", || {
                sqlx::query(&sql)
                    .bind(creator_id.0)
                    .fetch_optional(&self.pool)
                    .map_err(Error::from)
            })
            .await?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn create_draft(&self, creator_id: UserId, at: DateTime<Utc>) -> Result<Request> {
        let sql = format!(
            "INSERT INTO requests (status, creator_id, created_at)
             VALUES ('draft', $1, $2)
             RETURNING {REQUEST_COLUMNS}"
        );
        let row = self
            .retry
            .run("request.create_draft", || {
                sqlx::query(&sql)
                    .bind(creator_id.0)
                    .bind(at)
                    .fetch_one(&self.pool)
                    .map_err(move |e| {
                        map_write_error(e, || format!("user {creator_id} already has a draft"))
                    })
            })
            .await?;
        request_from_row(&row)
    }

    async fn update_patient_metrics(
        &self,
        id: RequestId,
        metrics: PatientMetrics,
    ) -> Result<Option<Request>> {
        let sql = format!(
            "UPDATE requests
             SET patient_height_cm = COALESCE($2, patient_height_cm),
                 patient_weight_kg = COALESCE($3, patient_weight_kg)
             WHERE id = $1 AND status IN ('draft', 'formed')
             RETURNING {REQUEST_COLUMNS}"
        );
        let row = self
            .retry
            .run("request.update_patient_metrics", || {
                sqlx::query(&sql)
                    .bind(id.0)
                    .bind(metrics.height_cm)
                    .bind(metrics.weight_kg)
                    .fetch_optional(&self.pool)
                    .map_err(Error::from)
            })
            .await?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn insert_item(
        &self,
        id: RequestId,
        operation_id: OperationId,
        measurements: ItemMeasurements,
    ) -> Result<bool> {
        let result = self
            .retry
            .run("request.insert_item", || {
                sqlx::query(
                    "WITH r AS (
                         SELECT id FROM requests WHERE id = $1 AND status = 'draft' FOR SHARE
                     )
                     INSERT INTO request_items
                         (request_id, operation_id, hb_before, hb_after,
                          surgery_duration_hours, total_blood_loss_ml)
                     SELECT r.id, $2, $3, $4, $5, $6 FROM r",
                )
                .bind(id.0)
                .bind(operation_id.0)
                .bind(measurements.hb_before)
                .bind(measurements.hb_after)
                .bind(measurements.surgery_duration_hours)
                .bind(measurements.total_blood_loss_ml)
                .execute(&self.pool)
                .map_err(move |e| {
                    map_write_error(e, || {
                        format!("operation {operation_id} is already part of request {id}")
                    })
                })
            })
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_item(
        &self,
        id: RequestId,
        operation_id: OperationId,
        update: &ItemUpdate,
    ) -> Result<Option<RequestItem>> {
        let row = self
            .retry
            .run("request.update_item", || {
                sqlx::query(
                    "WITH r AS (
                         SELECT id FROM requests WHERE id = $1 AND status = 'draft' FOR SHARE
                     )
                     UPDATE request_items ri SET
                         hb_before = CASE WHEN $3 THEN ri.hb_before ELSE $4 END,
                         hb_after = CASE WHEN $5 THEN ri.hb_after ELSE $6 END,
                         surgery_duration_hours =
                             CASE WHEN $7 THEN ri.surgery_duration_hours ELSE $8 END,
                         total_blood_loss_ml =
                             CASE WHEN $9 THEN ri.total_blood_loss_ml ELSE $10 END
                     FROM r
                     WHERE ri.request_id = r.id AND ri.operation_id = $2
                     RETURNING ri.request_id, ri.operation_id, ri.hb_before, ri.hb_after,
                               ri.surgery_duration_hours, ri.total_blood_loss_ml",
                )
                .bind(id.0)
                .bind(operation_id.0)
                .bind(update.hb_before.is_keep())
                .bind(update.hb_before.as_set().copied())
                .bind(update.hb_after.is_keep())
                .bind(update.hb_after.as_set().copied())
                .bind(update.surgery_duration_hours.is_keep())
                .bind(update.surgery_duration_hours.as_set().copied())
                .bind(update.total_blood_loss_ml.is_keep())
                .bind(update.total_blood_loss_ml.as_set().copied())
                .fetch_optional(&self.pool)
                .map_err(Error::from)
            })
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn remove_item(&self, id: RequestId, operation_id: OperationId) -> Result<bool> {
        let result = self
            .retry
            .run("request.remove_item", || {
                sqlx::query(
                    "WITH r AS (
                         SELECT id FROM requests WHERE id = $1 AND status = 'draft' FOR SHARE
                     )
                     DELETE FROM request_items ri
                     USING r
                     WHERE ri.request_id = r.id AND ri.operation_id = $2",
                )
                .bind(id.0)
                .bind(operation_id.0)
                .execute(&self.pool)
                .map_err(Error::from)
            })
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_formed(&self, id: RequestId, at: DateTime<Utc>) -> Result<Option<Request>> {
        self.retry
            .run("request.mark_formed", || self.form_once(id, at))
            .await
    }

    async fn mark_deleted(&self, id: RequestId) -> Result<bool> {
        let result = self
            .retry
            .run("request.mark_deleted", || {
                sqlx::query("UPDATE requests SET status = 'deleted' WHERE id = $1")
                    .bind(id.0)
                    .execute(&self.pool)
                    .map_err(Error::from)
            })
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_for_creator(
        &self,
        creator_id: UserId,
        filter: &ListFilter,
    ) -> Result<Vec<Request>> {
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM requests
             WHERE creator_id = $1
               AND status <> 'deleted'
               AND ($2::text IS NULL OR status = $2)
               AND ($3::timestamptz IS NULL OR created_at >= $3)
               AND ($4::timestamptz IS NULL OR created_at <= $4)
             ORDER BY created_at DESC, id DESC"
        );
        let status = filter.status.map(|s| s.as_str());
        let rows = self
            .retry
            .run("request.list_for_creator", || {
                sqlx::query(&sql)
                    .bind(creator_id.0)
                    .bind(status)
                    .bind(filter.date_from)
                    .bind(filter.date_to)
                    .fetch_all(&self.pool)
                    .map_err(Error::from)
            })
            .await?;
        rows.iter().map(request_from_row).collect()
    }

    async fn list_all(&self, filter: &ListFilter, include_all: bool) -> Result<Vec<Request>> {
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM requests
             WHERE ($1 OR status NOT IN ('draft', 'deleted'))
               AND ($2::text IS NULL OR status = $2)
               AND ($3::timestamptz IS NULL OR formed_at >= $3)
               AND ($4::timestamptz IS NULL OR formed_at <= $4)
             ORDER BY created_at DESC, id DESC"
        );
        let status = filter.status.map(|s| s.as_str());
        let rows = self
            .retry
            .run("request.list_all", || {
                sqlx::query(&sql)
                    .bind(include_all)
                    .bind(status)
                    .bind(filter.date_from)
                    .bind(filter.date_to)
                    .fetch_all(&self.pool)
                    .map_err(Error::from)
            })
            .await?;
        rows.iter().map(request_from_row).collect()
    }

    async fn begin(&self) -> Result<Box<dyn RequestTransaction>> {
        let tx = self
            .retry
            .run("request.begin", || self.pool.begin().map_err(Error::from))
            .await?;
        Ok(Box::new(PostgresRequestTransaction::new(tx)))
    }
}

/// Completion unit of work over a single database transaction.
pub struct PostgresRequestTransaction {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PostgresRequestTransaction {
    pub fn new(tx: Transaction<'static, Postgres>) -> Self {
        Self { tx: Some(tx) }
    }

    fn tx_mut(&mut self) -> Result<&mut Transaction<'static, Postgres>> {
        self.tx.as_mut().ok_or_else(|| {
            Error::Internal("Transaction already committed or rolled back".to_string())
        })
    }
}

#[async_trait]
impl RequestTransaction for PostgresRequestTransaction {
    async fn lock_request(&mut self, id: RequestId) -> Result<Option<Request>> {
        let tx = self.tx_mut()?;
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| retry::surface(e.into()))?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn completion_items(&mut self, id: RequestId) -> Result<Vec<CompletionItem>> {
        let tx = self.tx_mut()?;
        let rows = sqlx::query(
            "SELECT ri.operation_id, ri.hb_before, ri.hb_after, ri.surgery_duration_hours,
                    ri.total_blood_loss_ml, o.blood_loss_coeff, o.avg_blood_loss
             FROM request_items ri
             JOIN operations o ON o.id = ri.operation_id
             WHERE ri.request_id = $1
             ORDER BY ri.operation_id",
        )
        .bind(id.0)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| retry::surface(e.into()))?;

        rows.iter()
            .map(|row| -> Result<CompletionItem> {
                Ok(CompletionItem {
                    operation_id: OperationId(row.try_get("operation_id")?),
                    measurements: measurements_from_row(row)?,
                    blood_loss_coeff: row.try_get("blood_loss_coeff")?,
                    avg_blood_loss: row.try_get("avg_blood_loss")?,
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
        let tx = self.tx_mut()?;
        let result = sqlx::query(
            "UPDATE request_items
             SET total_blood_loss_ml = $3
             WHERE request_id = $1 AND operation_id = $2 AND total_blood_loss_ml IS NULL",
        )
        .bind(id.0)
        .bind(operation_id.0)
        .bind(total_ml)
        .execute(&mut **tx)
        .await
        .map_err(|e| retry::surface(e.into()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_completed(
        &mut self,
        id: RequestId,
        moderator_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<Option<Request>> {
        let tx = self.tx_mut()?;
        let sql = format!(
            "UPDATE requests
             SET status = 'completed', completed_at = $3, moderator_id = $2
             WHERE id = $1 AND status = 'formed'
             RETURNING {REQUEST_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.0)
            .bind(moderator_id.0)
            .bind(at)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| retry::surface(e.into()))?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let tx = self.tx.take().ok_or_else(|| {
            Error::Internal("Transaction already committed or rolled back".to_string())
        })?;
        tx.commit().await.map_err(|e| retry::surface(e.into()))
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl OperationCatalog for PostgresStore {
    async fn get(&self, id: OperationId) -> Result<Option<Operation>> {
        let sql = format!("SELECT {OPERATION_COLUMNS} FROM operations WHERE id = $1");
        let row = self
            .retry
            .run("operation.get", || {
                sqlx::query(&sql)
                    .bind(id.0)
                    .fetch_optional(&self.pool)
                    .map_err(Error::from)
            })
            .await?;
        row.as_ref().map(operation_from_row).transpose()
    }

    async fn list(&self, filter: &OperationFilter) -> Result<Vec<Operation>> {
        let sql = format!(
            "SELECT {OPERATION_COLUMNS} FROM operations
             WHERE ($1::text IS NULL OR title ILIKE '%' || $1 || '%')
               AND ($2::text IS NULL OR status = $2)
             ORDER BY id"
        );
        let title = filter
            .title
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(escape_like);
        let status = filter.status.map(|s| s.as_str());
        let rows = self
            .retry
            .run("operation.list", || {
                sqlx::query(&sql)
                    .bind(title.as_deref())
                    .bind(status)
                    .fetch_all(&self.pool)
                    .map_err(Error::from)
            })
            .await?;
        rows.iter().map(operation_from_row).collect()
    }

    async fn create(&self, operation: NewOperation) -> Result<Operation> {
        let sql = format!(
            "INSERT INTO operations
                 (title, description, status, image_url, blood_loss_coeff, avg_blood_loss)
             VALUES ($1, $2, 'active', $3, $4, $5)
             RETURNING {OPERATION_COLUMNS}"
        );
        let row = self
            .retry
            .run("operation.create", || {
                sqlx::query(&sql)
                    .bind(&operation.title)
                    .bind(operation.description.as_deref())
                    .bind(operation.image_url.as_deref())
                    .bind(operation.blood_loss_coeff)
                    .bind(operation.avg_blood_loss)
                    .fetch_one(&self.pool)
                    .map_err(Error::from)
            })
            .await?;
        operation_from_row(&row)
    }

    async fn update(&self, id: OperationId, patch: &OperationPatch) -> Result<Option<Operation>> {
        let sql = format!(
            "UPDATE operations SET
                 title = COALESCE($2, title),
                 description = CASE WHEN $3 THEN description ELSE $4 END,
                 image_url = CASE WHEN $5 THEN image_url ELSE $6 END,
                 blood_loss_coeff = COALESCE($7, blood_loss_coeff),
                 avg_blood_loss = COALESCE($8, avg_blood_loss),
                 status = COALESCE($9, status)
             WHERE id = $1
             RETURNING {OPERATION_COLUMNS}"
        );
        let status = patch.status.map(|s| s.as_str());
        let row = self
            .retry
            .run("operation.update", || {
                sqlx::query(&sql)
                    .bind(id.0)
                    .bind(patch.title.as_deref())
                    .bind(patch.description.is_keep())
                    .bind(patch.description.as_set().map(String::as_str))
                    .bind(patch.image_url.is_keep())
                    .bind(patch.image_url.as_set().map(String::as_str))
                    .bind(patch.blood_loss_coeff)
                    .bind(patch.avg_blood_loss)
                    .bind(status)
                    .fetch_optional(&self.pool)
                    .map_err(Error::from)
            })
            .await?;
        row.as_ref().map(operation_from_row).transpose()
    }

    async fn archive(&self, id: OperationId) -> Result<Option<Operation>> {
        let sql = format!(
            "UPDATE operations SET status = $2 WHERE id = $1 RETURNING {OPERATION_COLUMNS}"
        );
        let row = self
            .retry
            .run("operation.archive", || {
                sqlx::query(&sql)
                    .bind(id.0)
                    .bind(OperationStatus::Archived.as_str())
                    .fetch_optional(&self.pool)
                    .map_err(Error::from)
            })
            .await?;
        row.as_ref().map(operation_from_row).transpose()
    }
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
