//! RequestLifecycle against the in-memory store: races and timeouts.

use futures::future::join_all;
use hemocalc_server::{
    db::{MemoryStore, RequestStore},
    models::{ItemMeasurements, NewOperation, OperationId, PatientMetrics, RequestStatus, UserId},
    services::{Caller, RequestLifecycle},
    Error,
};
use std::{sync::Arc, time::Duration};

const CREATOR: UserId = UserId(1);
const MODERATOR: UserId = UserId(100);

struct Fixture {
    store: Arc<MemoryStore>,
    lifecycle: Arc<RequestLifecycle>,
    operation: OperationId,
}

async fn fixture(timeout: Duration) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let operation = hemocalc_server::db::OperationCatalog::create(
        store.as_ref(),
        NewOperation {
            title: "Gastrectomy".to_string(),
            description: None,
            image_url: None,
            blood_loss_coeff: 0.12,
            avg_blood_loss: 1250,
        },
    )
    .await
    .unwrap()
    .id;
    let lifecycle = Arc::new(RequestLifecycle::new(store.clone(), store.clone(), timeout));
    Fixture {
        store,
        lifecycle,
        operation,
    }
}

fn measurements() -> ItemMeasurements {
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

async fn formed_request(f: &Fixture) -> hemocalc_server::models::RequestId {
    let (draft, _) = f
        .lifecycle
        .add_to_draft(Caller::user(CREATOR), f.operation, measurements(), patient())
        .await
        .unwrap();
    f.lifecycle.form(draft.id, CREATOR).await.unwrap();
    draft.id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ensure_draft_yields_one_draft() {
    let f = fixture(Duration::from_secs(5)).await;

    let calls = (0..16).map(|_| {
        let lifecycle = f.lifecycle.clone();
        tokio::spawn(async move { lifecycle.ensure_draft(CREATOR).await })
    });
    let ids: Vec<_> = join_all(calls)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap().id)
        .collect();

    assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(
        f.store.current_draft(CREATOR).await.unwrap().unwrap().id,
        ids[0]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_completion_succeeds_once() {
    let f = fixture(Duration::from_secs(5)).await;
    let id = formed_request(&f).await;

    let calls = (0..8).map(|i| {
        let lifecycle = f.lifecycle.clone();
        tokio::spawn(async move { lifecycle.complete(id, UserId(MODERATOR.0 + i)).await })
    });
    let results: Vec<_> = join_all(calls)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let succeeded: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(succeeded.len(), 1);
    assert_eq!(succeeded[0].total_blood_loss_ml, 854);
    assert!(results.iter().filter(|r| r.is_err()).all(|r| matches!(
        r,
        Err(Error::InvalidState {
            status: RequestStatus::Completed,
            ..
        })
    )));

    let request = f.store.get(id).await.unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Completed);
    assert!(request.completed_at.is_some());
}

#[tokio::test]
async fn completed_requests_keep_their_totals() {
    let f = fixture(Duration::from_secs(5)).await;
    let id = formed_request(&f).await;
    f.lifecycle.complete(id, MODERATOR).await.unwrap();

    let item = f.store.item(id, f.operation).await.unwrap().unwrap();
    assert_eq!(item.measurements.total_blood_loss_ml, Some(854));

    // Completed requests reject every further transition except delete.
    assert!(matches!(
        f.lifecycle.form(id, CREATOR).await,
        Err(Error::InvalidState { .. })
    ));
    assert!(matches!(
        f.lifecycle.complete(id, MODERATOR).await,
        Err(Error::InvalidState { .. })
    ));
    f.lifecycle.delete(id, Caller::user(CREATOR)).await.unwrap();
    assert_eq!(
        f.store.get(id).await.unwrap().unwrap().status,
        RequestStatus::Deleted
    );
}

#[tokio::test]
async fn form_races_with_item_removal_consistently() {
    let f = fixture(Duration::from_secs(5)).await;
    let (draft, _) = f
        .lifecycle
        .add_to_draft(Caller::user(CREATOR), f.operation, measurements(), patient())
        .await
        .unwrap();

    let remove = f
        .lifecycle
        .remove_item(draft.id, Caller::user(CREATOR), f.operation);
    let form = f.lifecycle.form(draft.id, CREATOR);
    let (removed, formed) = tokio::join!(remove, form);

    let request = f.store.get(draft.id).await.unwrap().unwrap();
    match (removed, formed) {
        // Removal first: nothing left to form.
        (Ok(()), Err(Error::PreconditionFailed(_))) => {
            assert_eq!(request.status, RequestStatus::Draft)
        }
        // Form first: the item is frozen.
        (Err(Error::InvalidState { .. }), Ok(_)) => {
            assert_eq!(request.status, RequestStatus::Formed);
            assert_eq!(f.store.count_items(draft.id).await.unwrap(), 1);
        }
        other => panic!("unexpected interleaving: {other:?}"),
    }
}

#[tokio::test]
async fn operations_time_out_as_unavailable() {
    let f = fixture(Duration::from_millis(50)).await;
    let id = formed_request(&f).await;

    // An open transaction holds the store for its lifetime.
    let tx = f.store.begin().await.unwrap();
    let err = f.lifecycle.complete(id, MODERATOR).await.unwrap_err();
    assert!(matches!(err, Error::Unavailable(_)));
    tx.rollback().await.unwrap();

    let request = f.store.get(id).await.unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Formed);
    assert!(f.lifecycle.complete(id, MODERATOR).await.is_ok());
}

#[tokio::test]
async fn moderators_may_delete_but_not_edit_items() {
    let f = fixture(Duration::from_secs(5)).await;
    let (draft, _) = f
        .lifecycle
        .add_to_draft(Caller::user(CREATOR), f.operation, measurements(), patient())
        .await
        .unwrap();

    let err = f
        .lifecycle
        .remove_item(draft.id, Caller::moderator(MODERATOR), f.operation)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Forbidden(_)));

    f.lifecycle
        .delete(draft.id, Caller::moderator(MODERATOR))
        .await
        .unwrap();
    let summary = f.lifecycle.draft_summary(CREATOR).await.unwrap();
    assert_eq!(summary.current_request_id, None);
}
