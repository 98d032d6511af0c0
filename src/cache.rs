//! Process-scoped model cache.
//!
//! Keeps loaded pipelines alive across generate requests so an interactive
//! surface does not reload weights on every click. The cache is an explicit
//! value: the caller constructs it once, passes it where needed, and tears it
//! down with [`PipelineCache::shutdown`]. There is no global state.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use candle_core::Device;

use crate::error::Result;
use crate::pipeline::DdpmPipeline;

pub struct PipelineCache {
    pipelines: Mutex<HashMap<String, Arc<DdpmPipeline>>>,
    cache_dir: Option<PathBuf>,
    device: Device,
}

impl PipelineCache {
    /// `cache_dir` is where downloaded weights live; `None` falls back to
    /// the hub's default cache location.
    pub fn new(cache_dir: Option<PathBuf>, device: Device) -> Self {
        Self {
            pipelines: Mutex::new(HashMap::new()),
            cache_dir,
            device,
        }
    }

    /// Load `model_id` on first use; later calls share the same pipeline.
    /// The lock is held across the load so concurrent first use performs the
    /// download exactly once.
    pub fn get_or_load(&self, model_id: &str) -> Result<Arc<DdpmPipeline>> {
        let mut pipelines = self.pipelines.lock().unwrap();
        if let Some(pipeline) = pipelines.get(model_id) {
            return Ok(pipeline.clone());
        }
        tracing::info!(model_id, "loading pipeline into cache");
        let pipeline = Arc::new(DdpmPipeline::from_pretrained(
            model_id,
            self.cache_dir.as_deref(),
            &self.device,
        )?);
        pipelines.insert(model_id.to_string(), pipeline.clone());
        Ok(pipeline)
    }

    /// Register an already-built pipeline, e.g. one constructed from local
    /// files. Replaces any previous entry under the same id.
    pub fn insert(&self, model_id: &str, pipeline: Arc<DdpmPipeline>) {
        self.pipelines
            .lock()
            .unwrap()
            .insert(model_id.to_string(), pipeline);
    }

    /// Drop every cached pipeline. The cache can be reused afterwards.
    pub fn shutdown(&self) {
        self.pipelines.lock().unwrap().clear();
        tracing::info!("pipeline cache cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::DenoisingModel;
    use crate::schedulers::DdpmSchedulerConfig;
    use candle_core::Tensor;

    struct ZeroModel;

    impl DenoisingModel for ZeroModel {
        fn predict_noise(&self, latent: &Tensor, _timestep: usize) -> candle_core::Result<Tensor> {
            latent.zeros_like()
        }
    }

    fn stub_pipeline() -> Arc<DdpmPipeline> {
        Arc::new(DdpmPipeline::new(
            Arc::new(ZeroModel),
            DdpmSchedulerConfig::default(),
            (3, 8, 8),
            Device::Cpu,
        ))
    }

    #[test]
    fn cached_entries_are_shared() {
        let cache = PipelineCache::new(None, Device::Cpu);
        let pipeline = stub_pipeline();
        cache.insert("stub/model", pipeline.clone());
        let fetched = cache.get_or_load("stub/model").unwrap();
        assert!(Arc::ptr_eq(&pipeline, &fetched));
    }

    #[test]
    fn shutdown_releases_entries() {
        let cache = PipelineCache::new(None, Device::Cpu);
        let pipeline = stub_pipeline();
        cache.insert("stub/model", pipeline.clone());
        cache.shutdown();
        // Only the caller's Arc remains once the cache dropped its copy.
        assert_eq!(Arc::strong_count(&pipeline), 1);
    }
}
