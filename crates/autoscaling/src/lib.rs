//! Storage for `HorizontalPodAutoscaler` objects: the generic registry bound
//! to the autoscaling kind under `<key_root>/horizontalpodautoscalers`.

#![forbid(unsafe_code)]

use std::sync::Arc;

use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use tessera_registry::{JsonCodec, Registry, RegistryConfig};
use tessera_store::VersionedStore;

/// Collection segment the autoscaler keys live under.
pub const RESOURCE: &str = "horizontalpodautoscalers";

pub type HorizontalPodAutoscalerStorage = Registry<HorizontalPodAutoscaler, JsonCodec>;

pub fn new_storage(store: Arc<dyn VersionedStore>, config: &RegistryConfig) -> HorizontalPodAutoscalerStorage {
    let storage = Registry::for_kind(store, JsonCodec, config.clone());
    tracing::debug!(base = %storage.keys().base(), "autoscaling storage ready");
    storage
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_store::MemStore;

    #[test]
    fn keys_live_under_the_kind_plural() {
        let storage = new_storage(Arc::new(MemStore::new()), &RegistryConfig::default());
        assert!(storage.keys().is_namespaced());
        assert_eq!(storage.keys().base(), format!("/registry/{}", RESOURCE));
    }
}
