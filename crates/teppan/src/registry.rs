//! Static catalog of loadable inference units.
//!
//! Populated once at process start from configuration and read-only after
//! that, so lookups need no locking; handles are shared by `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::PipelineError;
use crate::model::{DeviceId, DeviceSpec, ModelHandle, ModelKind, ModelSpec};

#[derive(Debug)]
pub struct ModelRegistry {
    handles: Vec<Arc<ModelHandle>>,
    by_kind: HashMap<ModelKind, Vec<usize>>,
    devices: HashMap<DeviceId, u64>,
    device_order: Vec<DeviceId>,
}

impl ModelRegistry {
    /// Builds the registry from startup configuration.
    ///
    /// Fails if a model names a device that is not declared, or if two
    /// models of the same kind share a name.
    pub fn from_specs(
        models: &[ModelSpec],
        devices: &[DeviceSpec],
    ) -> Result<Self, PipelineError> {
        let mut device_budgets = HashMap::new();
        let mut device_order = Vec::new();
        for device in devices {
            if device_budgets
                .insert(device.id.clone(), device.memory_budget_bytes)
                .is_some()
            {
                return Err(PipelineError::Config(format!(
                    "duplicate device {}",
                    device.id
                )));
            }
            device_order.push(device.id.clone());
        }

        let mut handles: Vec<Arc<ModelHandle>> = Vec::with_capacity(models.len());
        let mut by_kind: HashMap<ModelKind, Vec<usize>> = HashMap::new();
        for spec in models {
            if !device_budgets.contains_key(&spec.device) {
                return Err(PipelineError::Config(format!(
                    "model {} placed on undeclared device {}",
                    spec.name, spec.device
                )));
            }
            let duplicate = by_kind
                .get(&spec.kind)
                .map(|indices| indices.iter().any(|&i| handles[i].name == spec.name))
                .unwrap_or(false);
            if duplicate {
                return Err(PipelineError::Config(format!(
                    "duplicate {:?} model {}",
                    spec.kind, spec.name
                )));
            }
            by_kind.entry(spec.kind).or_default().push(handles.len());
            handles.push(Arc::new(ModelHandle::from(spec)));
        }

        Ok(Self {
            handles,
            by_kind,
            devices: device_budgets,
            device_order,
        })
    }

    /// Resolves a handle by kind and optionally by name.
    ///
    /// With no name, the first registered model of the kind wins; this is
    /// the configuration order, so hosts list their default model first.
    pub fn resolve(
        &self,
        kind: ModelKind,
        name: Option<&str>,
    ) -> Result<Arc<ModelHandle>, PipelineError> {
        let miss = || PipelineError::ModelNotFound {
            kind,
            name: name.map(str::to_string),
        };
        let indices = self.by_kind.get(&kind).ok_or_else(miss)?;
        match name {
            None => indices
                .first()
                .map(|&i| self.handles[i].clone())
                .ok_or_else(miss),
            Some(wanted) => indices
                .iter()
                .map(|&i| &self.handles[i])
                .find(|h| h.name == wanted)
                .cloned()
                .ok_or_else(miss),
        }
    }

    /// All handles registered for a kind, in configuration order.
    pub fn list(&self, kind: ModelKind) -> Vec<Arc<ModelHandle>> {
        self.by_kind
            .get(&kind)
            .map(|indices| indices.iter().map(|&i| self.handles[i].clone()).collect())
            .unwrap_or_default()
    }

    /// Declared devices, in configuration order.
    pub fn devices(&self) -> &[DeviceId] {
        &self.device_order
    }

    /// Declared memory budget of a device.
    pub fn memory_budget(&self, device: &DeviceId) -> Option<u64> {
        self.devices.get(device).copied()
    }

    /// Kinds that have at least one model placed on the given device.
    pub fn kinds_on_device(&self, device: &DeviceId) -> Vec<ModelKind> {
        ModelKind::ALL
            .into_iter()
            .filter(|kind| {
                self.by_kind
                    .get(kind)
                    .map(|indices| indices.iter().any(|&i| self.handles[i].device == *device))
                    .unwrap_or(false)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, kind: ModelKind, device: &str) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            kind,
            device: device.into(),
            max_batch_size: 4,
            max_sequence_length: 128,
            approx_latency_ms: 10,
            memory_footprint_bytes: 1024,
        }
    }

    fn gpu0() -> DeviceSpec {
        DeviceSpec {
            id: "gpu0".into(),
            memory_budget_bytes: 1 << 30,
        }
    }

    #[test]
    fn resolves_default_and_named() {
        let registry = ModelRegistry::from_specs(
            &[
                spec("embed-small", ModelKind::Embedder, "gpu0"),
                spec("embed-large", ModelKind::Embedder, "gpu0"),
            ],
            &[gpu0()],
        )
        .unwrap();

        let default = registry.resolve(ModelKind::Embedder, None).unwrap();
        assert_eq!(default.name, "embed-small");

        let named = registry
            .resolve(ModelKind::Embedder, Some("embed-large"))
            .unwrap();
        assert_eq!(named.name, "embed-large");
        assert_eq!(registry.list(ModelKind::Embedder).len(), 2);
    }

    #[test]
    fn miss_is_model_not_found() {
        let registry = ModelRegistry::from_specs(
            &[spec("embed-small", ModelKind::Embedder, "gpu0")],
            &[gpu0()],
        )
        .unwrap();

        let err = registry.resolve(ModelKind::Generator, None).unwrap_err();
        assert!(matches!(err, PipelineError::ModelNotFound { .. }));

        let err = registry
            .resolve(ModelKind::Embedder, Some("missing"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::ModelNotFound { .. }));
    }

    #[test]
    fn undeclared_device_is_rejected() {
        let err = ModelRegistry::from_specs(
            &[spec("embed-small", ModelKind::Embedder, "gpu9")],
            &[gpu0()],
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn kinds_on_device_reflects_placement() {
        let registry = ModelRegistry::from_specs(
            &[
                spec("whisper", ModelKind::Transcriber, "gpu0"),
                spec("embed", ModelKind::Embedder, "gpu0"),
            ],
            &[gpu0()],
        )
        .unwrap();
        let kinds = registry.kinds_on_device(&"gpu0".into());
        assert_eq!(kinds, vec![ModelKind::Transcriber, ModelKind::Embedder]);
    }
}
