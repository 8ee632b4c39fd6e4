//! Decode registry mapping payload kinds back to runnable jobs.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use conveyor_core::{ConveyorError, Job, Result};

type DecodeFn =
    Arc<dyn Fn(Value) -> anyhow::Result<Arc<dyn Job>> + Send + Sync>;

/// Maps the `kind` string of a stored payload envelope to a decode hook
/// producing the runnable job.
#[derive(Clone, Default)]
pub struct JobRegistry {
    decoders: HashMap<String, DecodeFn>,
}

impl JobRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decode hook for `kind`.
    pub fn register<F>(&mut self, kind: impl Into<String>, decode: F)
    where
        F: Fn(Value) -> anyhow::Result<Arc<dyn Job>> + Send + Sync + 'static,
    {
        self.decoders.insert(kind.into(), Arc::new(decode));
    }

    /// Register a serde-deserializable job type under `kind`.
    pub fn register_type<T>(&mut self, kind: impl Into<String>)
    where
        T: Job + DeserializeOwned,
    {
        self.register(kind, |body| {
            let job: T = serde_json::from_value(body)?;
            Ok(Arc::new(job) as Arc<dyn Job>)
        });
    }

    /// Decode a stored envelope. Fails on unknown kinds and on
    /// deserialization errors; the queue treats both as corrupted records.
    pub fn decode(&self, kind: &str, body: Value) -> Result<Arc<dyn Job>> {
        let decoder = self.decoders.get(kind).ok_or_else(|| {
            ConveyorError::Decode(format!("no decoder registered for kind {kind:?}"))
        })?;
        decoder(body)
            .map_err(|err| ConveyorError::Decode(format!("kind {kind:?}: {err}")))
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("kinds", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use conveyor_core::RunContext;

    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Echo {
        value: u32,
    }

    #[async_trait]
    impl Job for Echo {
        async fn run(&self, _ctx: RunContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn decodes_registered_kind() {
        let mut registry = JobRegistry::new();
        registry.register_type::<Echo>("echo");
        assert!(registry.decode("echo", json!({ "value": 7 })).is_ok());
    }

    #[test]
    fn unknown_kind_is_a_decode_error() {
        let registry = JobRegistry::new();
        let err = registry.decode("missing", json!({})).err().unwrap();
        assert!(matches!(err, ConveyorError::Decode(_)));
    }

    #[test]
    fn malformed_body_is_a_decode_error() {
        let mut registry = JobRegistry::new();
        registry.register_type::<Echo>("echo");
        let err = registry.decode("echo", json!("not an object")).err().unwrap();
        assert!(matches!(err, ConveyorError::Decode(_)));
    }
}
