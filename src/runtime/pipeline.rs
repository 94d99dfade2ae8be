//! Persistence pipeline modules.
//!
//! Modules add their own values to every save, and may persist them to their
//! own storage inside the same transaction as the instance store write.

use async_trait::async_trait;
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;

use super::deadline::Deadline;
use crate::WorkflowError;
use crate::providers::{InstanceData, ProviderError};
use crate::transaction::Transaction;

/// Extension hooked into persist and load.
///
/// Order per save: every module's `collect`, then every module's `map` over
/// the collected values, then `save` on the I/O participants. Every method has
/// a no-op default.
#[async_trait]
pub trait PersistencePipelineModule: Send + Sync {
    /// Values this module contributes to the instance data.
    fn collect(&self) -> InstanceData {
        InstanceData::new()
    }

    /// Values derived from everything collected so far.
    fn map(&self, _values: &InstanceData) -> InstanceData {
        InstanceData::new()
    }

    /// Whether `save`/`load` do I/O and should be awaited.
    fn is_io_participant(&self) -> bool {
        false
    }

    async fn save(&self, _values: &InstanceData, _tx: &Transaction, _timeout: Duration) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Hand loaded values to the module before the interpreter is restored.
    fn publish_values(&self, _values: &InstanceData) {}

    async fn load(&self, _values: &InstanceData, _timeout: Duration) -> Result<(), ProviderError> {
        Ok(())
    }

    /// The instance was aborted while the pipeline was in use.
    fn abort(&self) {}

    /// The instance was unloaded or completed.
    fn dispose(&self) {}
}

pub(crate) struct PersistencePipeline<'a> {
    modules: &'a [Arc<dyn PersistencePipelineModule>],
    values: InstanceData,
}

fn merge(target: &mut InstanceData, extra: InstanceData) -> Result<(), WorkflowError> {
    for (key, value) in extra {
        if target.contains_key(&key) {
            return Err(WorkflowError::InvalidState(format!(
                "instance value {key} was contributed more than once"
            )));
        }
        target.insert(key, value);
    }
    Ok(())
}

impl<'a> PersistencePipeline<'a> {
    pub(crate) fn new(modules: &'a [Arc<dyn PersistencePipelineModule>], values: InstanceData) -> Self {
        Self { modules, values }
    }

    pub(crate) fn collect(&mut self) -> Result<(), WorkflowError> {
        for module in self.modules {
            merge(&mut self.values, module.collect())?;
        }
        Ok(())
    }

    pub(crate) fn map(&mut self) -> Result<(), WorkflowError> {
        let mut mapped = InstanceData::new();
        for module in self.modules {
            merge(&mut mapped, module.map(&self.values))?;
        }
        merge(&mut self.values, mapped)
    }

    pub(crate) fn values(&self) -> &InstanceData {
        &self.values
    }

    #[cfg(test)]
    pub(crate) fn into_values(self) -> InstanceData {
        self.values
    }

    /// Save through every I/O participant concurrently.
    pub(crate) async fn save(&self, tx: &Transaction, deadline: &Deadline) -> Result<(), WorkflowError> {
        let timeout = deadline.remaining().unwrap_or(Duration::MAX);
        let saves = self
            .modules
            .iter()
            .filter(|m| m.is_io_participant())
            .map(|m| m.save(&self.values, tx, timeout));
        deadline.run("pipeline_save", try_join_all(saves)).await??;
        Ok(())
    }

    pub(crate) fn publish(&self) {
        for module in self.modules {
            module.publish_values(&self.values);
        }
    }

    pub(crate) async fn load(&self, deadline: &Deadline) -> Result<(), WorkflowError> {
        let timeout = deadline.remaining().unwrap_or(Duration::MAX);
        let loads = self
            .modules
            .iter()
            .filter(|m| m.is_io_participant())
            .map(|m| m.load(&self.values, timeout));
        deadline.run("pipeline_load", try_join_all(loads)).await??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::InstanceValue;
    use serde_json::json;

    struct Fixed(&'static str);

    #[async_trait]
    impl PersistencePipelineModule for Fixed {
        fn collect(&self) -> InstanceData {
            InstanceData::from([(self.0.to_string(), InstanceValue::new(json!(1)))])
        }

        fn map(&self, values: &InstanceData) -> InstanceData {
            InstanceData::from([(
                format!("{}.count", self.0),
                InstanceValue::new(json!(values.len())),
            )])
        }
    }

    #[test]
    fn collect_then_map_sees_all_collected() {
        let modules: Vec<Arc<dyn PersistencePipelineModule>> = vec![Arc::new(Fixed("a")), Arc::new(Fixed("b"))];
        let mut pipeline = PersistencePipeline::new(&modules, InstanceData::new());
        pipeline.collect().unwrap();
        pipeline.map().unwrap();
        let values = pipeline.into_values();
        assert_eq!(values["a.count"].value, json!(2));
        assert_eq!(values["b.count"].value, json!(2));
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let modules: Vec<Arc<dyn PersistencePipelineModule>> = vec![Arc::new(Fixed("a")), Arc::new(Fixed("a"))];
        let mut pipeline = PersistencePipeline::new(&modules, InstanceData::new());
        assert!(matches!(pipeline.collect(), Err(WorkflowError::InvalidState(_))));
    }
}
