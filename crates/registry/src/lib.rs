//! Tessera registry: typed create/get/list/update/delete for one resource
//! kind on top of any [`tessera_store::VersionedStore`].
//!
//! Objects are `kube::Resource` values; their `metadata` supplies name,
//! namespace, labels and deletion state, and `resourceVersion` mirrors the
//! store version of the last write.

#![forbid(unsafe_code)]

pub mod codec;
pub mod config;
mod context;
mod registry;
pub mod retry;
pub mod selector;

pub use codec::{Codec, JsonCodec};
pub use config::RegistryConfig;
pub use context::{RequestContext, NAMESPACE_DEFAULT};
pub use registry::{DeleteOptions, DeleteOutcome, KindScope, ListOptions, Registry, WatchEvent, WatchHandle};
pub use retry::{Backoff, ConflictRetryPolicy};
pub use selector::LabelSelector;

pub mod prelude {
    pub use crate::{DeleteOptions, DeleteOutcome, ListOptions, Registry, RegistryConfig, RequestContext, WatchEvent};
    pub use tessera_core::{Error, Result, Version};
}
