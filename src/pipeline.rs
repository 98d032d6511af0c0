//! End-to-end generation: pretrained weights in, finished images out.
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::api::sync::{Api, ApiBuilder};
use image::RgbImage;

use crate::error::{Error, Result};
use crate::images::latent_to_images;
use crate::model_kind::ModelKind;
use crate::sampler::{DdpmSampler, DenoisingModel, Interrupter, SampleOptions, SampleResult};
use crate::schedulers::DdpmSchedulerConfig;
use crate::unet::{UNet2DModel, UNet2DModelConfig};

/// Parameters an interactive surface exposes to its user.
#[derive(Debug, Clone, Copy)]
pub struct GenerateRequest {
    pub num_inference_steps: usize,
    pub batch_size: usize,
    pub seed: u64,
}

#[derive(Debug)]
pub struct GenerateResponse {
    pub images: Vec<RgbImage>,
    pub seed: u64,
    pub num_inference_steps: usize,
}

pub struct DdpmPipeline {
    model: Arc<dyn DenoisingModel>,
    scheduler_config: DdpmSchedulerConfig,
    latent_shape: (usize, usize, usize),
    device: Device,
}

impl DdpmPipeline {
    /// `latent_shape` is `(channels, height, width)` of one sample.
    pub fn new(
        model: Arc<dyn DenoisingModel>,
        scheduler_config: DdpmSchedulerConfig,
        latent_shape: (usize, usize, usize),
        device: Device,
    ) -> Self {
        Self {
            model,
            scheduler_config,
            latent_shape,
            device,
        }
    }

    /// Download the model artifacts from the Hugging Face Hub (or reuse the
    /// local cache) and build a ready pipeline. Every failure on this path,
    /// network, missing file or corrupt weights, is a `ModelUnavailable`.
    pub fn from_pretrained(
        model_id: &str,
        cache_dir: Option<&Path>,
        device: &Device,
    ) -> Result<Self> {
        let api = match cache_dir {
            Some(dir) => ApiBuilder::new()
                .with_cache_dir(dir.to_path_buf())
                .build(),
            None => Api::new(),
        }
        .map_err(Error::model)?;
        let repo = api.model(model_id.to_string());
        tracing::info!(model_id, "fetching model artifacts");
        let unet_config = repo.get("unet/config.json").map_err(Error::model)?;
        let scheduler_config = repo
            .get("scheduler/scheduler_config.json")
            .map_err(Error::model)?;
        let weights = repo
            .get("unet/diffusion_pytorch_model.safetensors")
            .map_err(Error::model)?;
        Self::from_files(&unet_config, &scheduler_config, &weights, device)
    }

    pub fn from_kind(kind: ModelKind, cache_dir: Option<&Path>, device: &Device) -> Result<Self> {
        Self::from_pretrained(kind.repo(), cache_dir, device)
    }

    /// Build a pipeline from local diffusers-layout files.
    pub fn from_files(
        unet_config: &Path,
        scheduler_config: &Path,
        weights: &Path,
        device: &Device,
    ) -> Result<Self> {
        let unet_config: UNet2DModelConfig =
            serde_json::from_reader(File::open(unet_config).map_err(Error::model)?)
                .map_err(Error::model)?;
        let scheduler_config: DdpmSchedulerConfig =
            serde_json::from_reader(File::open(scheduler_config).map_err(Error::model)?)
                .map_err(Error::model)?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device) }
            .map_err(Error::model)?;
        let latent_shape = (
            unet_config.in_channels,
            unet_config.sample_size,
            unet_config.sample_size,
        );
        let unet = UNet2DModel::new(vb, unet_config).map_err(Error::model)?;
        tracing::info!(
            channels = latent_shape.0,
            sample_size = latent_shape.1,
            "model ready"
        );
        Ok(Self::new(
            Arc::new(unet),
            scheduler_config,
            latent_shape,
            device.clone(),
        ))
    }

    pub fn sampler(&self) -> DdpmSampler {
        DdpmSampler::new(
            self.model.clone(),
            self.scheduler_config,
            self.latent_shape,
            self.device.clone(),
        )
    }

    pub fn generate(&self, options: &SampleOptions) -> Result<SampleResult> {
        self.sampler().sample(options)
    }

    pub fn generate_with_interrupt(
        &self,
        options: &SampleOptions,
        interrupter: &Interrupter,
    ) -> Result<SampleResult> {
        self.sampler().sample_with_interrupt(options, interrupter)
    }

    /// Synchronous request/response entry point for an interactive control
    /// surface: sample, then convert to pixel images. No state is shared
    /// between requests.
    pub fn handle_generate_request(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        let result = self.generate(&SampleOptions {
            batch_size: request.batch_size,
            num_inference_steps: request.num_inference_steps,
            seed: request.seed,
        })?;
        let images = latent_to_images(&result.latents)?;
        Ok(GenerateResponse {
            images,
            seed: result.seed,
            num_inference_steps: result.num_inference_steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;

    struct ZeroModel;

    impl DenoisingModel for ZeroModel {
        fn predict_noise(&self, latent: &Tensor, _timestep: usize) -> candle_core::Result<Tensor> {
            latent.zeros_like()
        }
    }

    fn pipeline() -> DdpmPipeline {
        DdpmPipeline::new(
            Arc::new(ZeroModel),
            DdpmSchedulerConfig::default(),
            (3, 8, 8),
            Device::Cpu,
        )
    }

    #[test]
    fn request_handler_returns_one_image_per_batch_element() {
        let response = pipeline()
            .handle_generate_request(&GenerateRequest {
                num_inference_steps: 4,
                batch_size: 3,
                seed: 42,
            })
            .unwrap();
        assert_eq!(response.images.len(), 3);
        assert_eq!(response.seed, 42);
        assert_eq!(response.num_inference_steps, 4);
        for image in &response.images {
            assert_eq!(image.dimensions(), (8, 8));
        }
    }

    #[test]
    fn repeated_requests_share_no_state() {
        let pipeline = pipeline();
        let request = GenerateRequest {
            num_inference_steps: 3,
            batch_size: 1,
            seed: 7,
        };
        let a = pipeline.handle_generate_request(&request).unwrap();
        let b = pipeline.handle_generate_request(&request).unwrap();
        assert_eq!(a.images[0].as_raw(), b.images[0].as_raw());
    }

    #[test]
    fn fifty_step_single_sample_yields_one_rgb_image() {
        let pipeline = DdpmPipeline::new(
            Arc::new(ZeroModel),
            DdpmSchedulerConfig::default(),
            (3, 32, 32),
            Device::Cpu,
        );
        let result = pipeline
            .generate(&SampleOptions {
                batch_size: 1,
                num_inference_steps: 50,
                seed: 42,
            })
            .unwrap();
        assert_eq!(result.latents.dims4().unwrap(), (1, 3, 32, 32));
        let images = latent_to_images(&result.latents).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].dimensions(), (32, 32));
    }

    #[test]
    fn invalid_requests_surface_configuration_errors() {
        let err = pipeline()
            .handle_generate_request(&GenerateRequest {
                num_inference_steps: 0,
                batch_size: 1,
                seed: 0,
            })
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
