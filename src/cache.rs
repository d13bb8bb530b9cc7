#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::store::KeyValueStore;

/// Lifetime of cached search responses and block lists.
pub const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Typed, best-effort view over a [`KeyValueStore`].
///
/// Store failures never reach the caller: a failed read is a miss and a
/// failed write is dropped, both logged at `warn`. Values that no longer
/// deserialize into the requested type are treated the same way.
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn KeyValueStore>,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = match self.store.get(key).await {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(err) => {
                warn!(key, error = %err, "cache read failed");
                return None;
            }
        };
        match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                warn!(key, error = %err, "discarding undecodable cache entry");
                None
            }
        }
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(err) => {
                warn!(key, error = %err, "cache value does not serialize");
                return;
            }
        };
        if let Err(err) = self.store.set(key, &value, ttl).await {
            warn!(key, error = %err, "cache write failed");
        }
    }

    pub async fn delete(&self, key: &str) {
        if let Err(err) = self.store.delete(key).await {
            warn!(key, error = %err, "cache delete failed");
        }
    }
}
