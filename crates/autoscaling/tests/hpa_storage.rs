#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::autoscaling::v1::{CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tessera_autoscaling::{new_storage, HorizontalPodAutoscalerStorage};
use tessera_core::Error;
use tessera_persist::SqliteStore;
use tessera_registry::{ListOptions, RegistryConfig, RequestContext, NAMESPACE_DEFAULT};
use tessera_store::{MemStore, VersionedStore};

fn storage() -> (HorizontalPodAutoscalerStorage, Arc<dyn VersionedStore>) {
    let store: Arc<dyn VersionedStore> = Arc::new(MemStore::new());
    (new_storage(store.clone(), &RegistryConfig::default()), store)
}

fn valid_new_hpa(name: &str) -> HorizontalPodAutoscaler {
    HorizontalPodAutoscaler {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE_DEFAULT.to_string()),
            ..Default::default()
        },
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".into()),
                kind: "Deployment".into(),
                name: "scale".into(),
            },
            min_replicas: Some(1),
            max_replicas: 5,
            target_cpu_utilization_percentage: Some(80),
        }),
        status: None,
    }
}

fn max_replicas(hpa: &HorizontalPodAutoscaler) -> i32 { hpa.spec.as_ref().map(|s| s.max_replicas).unwrap_or_default() }

#[tokio::test]
async fn create_valid_and_invalid() {
    let (storage, _) = storage();
    let ctx = RequestContext::default_namespace();

    let mut valid = valid_new_hpa("foo");
    valid.metadata = ObjectMeta { generate_name: Some("foo-".into()), ..Default::default() };
    let created = storage.create(&ctx, valid).await.unwrap();
    assert!(created.metadata.name.as_deref().is_some_and(|n| n.starts_with("foo-")));
    assert_eq!(created.metadata.namespace.as_deref(), Some(NAMESPACE_DEFAULT));

    let err = storage.create(&ctx, HorizontalPodAutoscaler::default()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)), "{err}");
}

#[tokio::test]
async fn update_bumps_max_replicas() {
    let (storage, _) = storage();
    let ctx = RequestContext::default_namespace();
    storage.create(&ctx, valid_new_hpa("foo")).await.unwrap();
    let updated = storage
        .update(&ctx, "foo", |mut hpa: HorizontalPodAutoscaler| {
            if let Some(spec) = hpa.spec.as_mut() {
                spec.max_replicas += 1;
            }
            Ok(hpa)
        })
        .await
        .unwrap();
    assert_eq!(max_replicas(&updated), 6);
    assert_eq!(max_replicas(&storage.get(&ctx, "foo").await.unwrap()), 6);
}

#[tokio::test(start_paused = true)]
async fn delete_is_graceful_by_default() {
    let (storage, store) = storage();
    let ctx = RequestContext::default_namespace();
    storage.create(&ctx, valid_new_hpa("foo2")).await.unwrap();

    let out = storage.delete_with(&ctx, "foo2", &Default::default()).await.unwrap();
    let marked = out.terminating().expect("graceful delete keeps the object");
    assert!(marked.metadata.deletion_timestamp.is_some());
    let key = storage.key_for(&ctx, "foo2").unwrap();
    assert_eq!(store.get(key.as_str()).await.unwrap().ttl_secs(), Some(30));

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(storage.get(&ctx, "foo2").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn zero_grace_deletes_immediately() {
    let (storage, _) = storage();
    let ctx = RequestContext::default_namespace();
    storage.create(&ctx, valid_new_hpa("foo3")).await.unwrap();
    assert!(storage.graceful_delete(&ctx, "foo3", Duration::ZERO).await.unwrap().is_deleted());
    assert!(storage.get(&ctx, "foo3").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn get_and_list() {
    let (storage, _) = storage();
    let ctx = RequestContext::default_namespace();
    let created = storage.create(&ctx, valid_new_hpa("foo")).await.unwrap();
    assert_eq!(storage.get(&ctx, "foo").await.unwrap(), created);

    storage.create(&RequestContext::with_namespace("other"), valid_new_hpa("bar")).await.unwrap_err();
    let mut elsewhere = valid_new_hpa("bar");
    elsewhere.metadata.namespace = None;
    storage.create(&RequestContext::with_namespace("other"), elsewhere).await.unwrap();

    let items = storage.list(&ctx, &ListOptions::default()).await.unwrap();
    assert_eq!(items, vec![created]);
    assert_eq!(storage.list(&RequestContext::new(), &ListOptions::default()).await.unwrap().len(), 2);
}

#[tokio::test]
async fn sqlite_backed_storage_round_trips() {
    let now = Arc::new(AtomicI64::new(1_000_000));
    let clock = {
        let now = now.clone();
        Arc::new(move || now.load(Ordering::SeqCst))
    };
    let store: Arc<dyn VersionedStore> = Arc::new(SqliteStore::open_in_memory().unwrap().with_clock(clock));
    let storage = new_storage(store.clone(), &RegistryConfig::default());
    let ctx = RequestContext::default_namespace();

    let created = storage.create(&ctx, valid_new_hpa("foo")).await.unwrap();
    assert_eq!(storage.get(&ctx, "foo").await.unwrap(), created);

    let marked = storage.graceful_delete(&ctx, "foo", Duration::from_secs(30)).await.unwrap().terminating().unwrap();
    assert_eq!(marked.metadata.deletion_grace_period_seconds, Some(30));
    now.fetch_add(31_000, Ordering::SeqCst);
    assert!(storage.get(&ctx, "foo").await.unwrap_err().is_not_found());
}
