//! Latest-Payload Cache
//!
//! Holds the single most recent accepted payload. The cache is owned by the
//! dispatcher, so reads and writes never interleave. An optional mirror
//! keeps a pretty-printed copy on disk and primes the cache at startup.

use super::message::META_KEY;
use crate::Result;
use anyhow::Context;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};

/// The most recently accepted payload, `_meta` included
#[derive(Debug, Clone, PartialEq)]
pub struct LatestPayload {
    value: Map<String, Value>,
    received_at: SystemTime,
    serialized: String,
}

impl LatestPayload {
    pub fn new(value: Map<String, Value>, received_at: SystemTime) -> Self {
        let serialized = Value::Object(value.clone()).to_string();
        Self {
            value,
            received_at,
            serialized,
        }
    }

    pub fn value(&self) -> &Map<String, Value> {
        &self.value
    }

    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }

    /// Compact JSON text as sent on the wire.
    pub fn as_json(&self) -> &str {
        &self.serialized
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.value.clone())
    }
}

/// Single-slot cache of the latest payload
#[derive(Debug, Default)]
pub struct PayloadCache {
    latest: Option<LatestPayload>,
}

impl PayloadCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(payload: LatestPayload) -> Self {
        Self {
            latest: Some(payload),
        }
    }

    /// `None` until the first payload is accepted.
    pub fn get(&self) -> Option<&LatestPayload> {
        self.latest.as_ref()
    }

    /// Replace the cached value, returning the previous one.
    pub fn set(&mut self, payload: LatestPayload) -> Option<LatestPayload> {
        self.latest.replace(payload)
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_none()
    }
}

/// On-disk copy of the latest payload, overwritten wholesale on each update
#[derive(Debug, Clone)]
pub struct PayloadMirror {
    path: PathBuf,
}

impl PayloadMirror {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write via a sibling temp file and rename, so readers never see a partial file.
    pub async fn write(&self, payload: &LatestPayload) -> Result<()> {
        let pretty = serde_json::to_string_pretty(payload.value())
            .context("Failed to serialize payload for mirror")?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, pretty)
            .await
            .with_context(|| format!("Failed to write mirror file: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace mirror file: {}", self.path.display()))?;

        debug!(path = %self.path.display(), "Mirrored latest payload");
        Ok(())
    }

    /// Read a previously mirrored payload. A missing file is not an error.
    pub async fn load(&self) -> Result<Option<LatestPayload>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read mirror file: {}", self.path.display())
                })
            }
        };

        let value: Value = serde_json::from_str(&content)
            .with_context(|| format!("Mirror file is not valid JSON: {}", self.path.display()))?;

        let Value::Object(map) = value else {
            anyhow::bail!("Mirror file does not hold a JSON object: {}", self.path.display());
        };

        let received_at = map
            .get(META_KEY)
            .and_then(|meta| meta.get("receivedAt"))
            .and_then(Value::as_str)
            .and_then(|ts| humantime::parse_rfc3339_weak(ts).ok())
            .unwrap_or_else(SystemTime::now);

        info!(path = %self.path.display(), "Restored latest payload from mirror");
        Ok(Some(LatestPayload::new(map, received_at)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    fn payload(v: Value) -> LatestPayload {
        match v {
            Value::Object(map) => LatestPayload::new(map, UNIX_EPOCH + Duration::from_secs(1)),
            _ => panic!("test payload must be an object"),
        }
    }

    #[test]
    fn test_cache_starts_empty() {
        let cache = PayloadCache::new();
        assert!(cache.is_empty());
        assert!(cache.get().is_none());
    }

    #[test]
    fn test_set_replaces_value() {
        let mut cache = PayloadCache::new();
        assert!(cache.set(payload(json!({"x": 1}))).is_none());

        let previous = cache.set(payload(json!({"x": 2}))).unwrap();
        assert_eq!(previous.value()["x"], json!(1));
        assert_eq!(cache.get().unwrap().value()["x"], json!(2));
        assert_eq!(cache.get().unwrap().as_json(), r#"{"x":2}"#);
    }

    #[tokio::test]
    async fn test_mirror_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let mirror = PayloadMirror::new(temp_dir.path().join("latest.json"));

        assert!(mirror.load().await.unwrap().is_none());

        let stored = payload(json!({
            "x": 1,
            "_meta": {"receivedAt": "2024-05-01T12:00:00.250Z"}
        }));
        mirror.write(&stored).await.unwrap();

        let on_disk = std::fs::read_to_string(mirror.path()).unwrap();
        assert!(on_disk.contains('\n'), "mirror should be pretty-printed");

        let restored = mirror.load().await.unwrap().unwrap();
        assert_eq!(restored.value(), stored.value());
        assert_eq!(
            restored.received_at(),
            humantime::parse_rfc3339("2024-05-01T12:00:00.250Z").unwrap()
        );
    }

    #[tokio::test]
    async fn test_mirror_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let mirror = PayloadMirror::new(temp_dir.path().join("latest.json"));

        mirror.write(&payload(json!({"x": 1}))).await.unwrap();
        mirror.write(&payload(json!({"x": 2}))).await.unwrap();

        let restored = mirror.load().await.unwrap().unwrap();
        assert_eq!(restored.value()["x"], json!(2));
    }

    #[tokio::test]
    async fn test_mirror_rejects_non_object() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("latest.json");
        std::fs::write(&path, "[1, 2]").unwrap();

        assert!(PayloadMirror::new(path).load().await.is_err());
    }

    #[tokio::test]
    async fn test_mirror_write_failure_reported() {
        let temp_dir = TempDir::new().unwrap();
        let mirror = PayloadMirror::new(temp_dir.path().join("missing-dir").join("latest.json"));
        assert!(mirror.write(&payload(json!({"x": 1}))).await.is_err());
    }
}
