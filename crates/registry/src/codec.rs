use anyhow::Context;
use serde::{de::DeserializeOwned, Serialize};

/// Converts objects to and from their stored byte form.
pub trait Codec<K>: Send + Sync {
    fn encode(&self, obj: &K) -> anyhow::Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> anyhow::Result<K>;
}

/// JSON via serde; the default codec for every kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<K> Codec<K> for JsonCodec
where
    K: Serialize + DeserializeOwned,
{
    fn encode(&self, obj: &K) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(obj).context("encoding object as json")
    }

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<K> {
        serde_json::from_slice(bytes).context("decoding json object")
    }
}
