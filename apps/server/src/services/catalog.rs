//! Operation catalog service
//!
//! Public reads and moderator CRUD. Operations are archived, never removed.

use std::sync::Arc;
use validator::{Validate, ValidateUrl as _};

use crate::{
    db::OperationCatalog,
    models::{NewOperation, Operation, OperationFilter, OperationId, OperationPatch},
    Error, Result,
};

pub struct CatalogService {
    catalog: Arc<dyn OperationCatalog>,
}

impl CatalogService {
    pub fn new(catalog: Arc<dyn OperationCatalog>) -> Self {
        Self { catalog }
    }

    pub async fn list(&self, filter: &OperationFilter) -> Result<Vec<Operation>> {
        self.catalog.list(filter).await
    }

    pub async fn get(&self, id: OperationId) -> Result<Operation> {
        self.catalog
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("operation {id}")))
    }

    pub async fn create(&self, operation: NewOperation) -> Result<Operation> {
        operation.validate()?;
        let created = self.catalog.create(operation).await?;
        tracing::info!(operation_id = %created.id, title = %created.title, "Operation created");
        Ok(created)
    }

    pub async fn update(&self, id: OperationId, patch: OperationPatch) -> Result<Operation> {
        if patch.is_empty() {
            return Err(Error::Validation("no fields provided".to_string()));
        }
        patch.validate()?;
        if let Some(url) = patch.image_url.as_set() {
            if !url.validate_url() {
                return Err(Error::Validation(format!("image_url: invalid url '{url}'")));
            }
        }

        let updated = self
            .catalog
            .update(id, &patch)
            .await?
            .ok_or_else(|| Error::NotFound(format!("operation {id}")))?;
        tracing::info!(operation_id = %id, "Operation updated");
        Ok(updated)
    }

    pub async fn archive(&self, id: OperationId) -> Result<Operation> {
        let archived = self
            .catalog
            .archive(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("operation {id}")))?;
        tracing::info!(operation_id = %id, "Operation archived");
        Ok(archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::MemoryStore,
        models::{FieldUpdate, OperationStatus},
    };

    fn service() -> CatalogService {
        CatalogService::new(Arc::new(MemoryStore::new()))
    }

    fn new_operation(title: &str) -> NewOperation {
        NewOperation {
            title: title.to_string(),
            description: Some("open approach".to_string()),
            image_url: None,
            blood_loss_coeff: 0.3,
            avg_blood_loss: 800,
        }
    }

    #[tokio::test]
    async fn archive_keeps_the_operation_readable() {
        let service = service();
        let created = service.create(new_operation("Hepatectomy")).await.unwrap();
        let archived = service.archive(created.id).await.unwrap();
        assert_eq!(archived.status, OperationStatus::Archived);
        assert_eq!(
            service.get(created.id).await.unwrap().status,
            OperationStatus::Archived
        );
    }

    #[tokio::test]
    async fn invalid_payloads_are_rejected() {
        let service = service();
        let err = service.create(new_operation("")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let created = service.create(new_operation("Whipple")).await.unwrap();
        let err = service
            .update(created.id, OperationPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let patch = OperationPatch {
            blood_loss_coeff: Some(-1.0),
            ..OperationPatch::default()
        };
        assert!(service.update(created.id, patch).await.is_err());
    }

    #[tokio::test]
    async fn create_and_update_agree_on_image_urls() {
        let service = service();
        let created = service.create(new_operation("Colectomy")).await.unwrap();

        for url in ["http://", "not a url", "ftp//missing-colon"] {
            let mut operation = new_operation("Colectomy");
            operation.image_url = Some(url.to_string());
            let created_ok = service.create(operation).await.is_ok();

            let patch = OperationPatch {
                image_url: FieldUpdate::Set(url.to_string()),
                ..OperationPatch::default()
            };
            let updated_ok = service.update(created.id, patch).await.is_ok();

            assert!(!created_ok, "create accepted {url}");
            assert_eq!(created_ok, updated_ok, "create and update disagree on {url}");
        }

        let patch = OperationPatch {
            image_url: FieldUpdate::Set("https://img.example.org/colectomy.png".to_string()),
            ..OperationPatch::default()
        };
        let updated = service.update(created.id, patch).await.unwrap();
        assert_eq!(
            updated.image_url.as_deref(),
            Some("https://img.example.org/colectomy.png")
        );
    }

    #[tokio::test]
    async fn unknown_operations_are_not_found() {
        let err = service().get(OperationId(99)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
