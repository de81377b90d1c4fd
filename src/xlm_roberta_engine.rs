use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_nn::ops::softmax;
use candle_transformers::models::xlm_roberta::{
    Config as XLMRobertaConfig, XLMRobertaForSequenceClassification,
};
use hf_hub::{Repo, RepoType, api::tokio::Api};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokenizers::{PaddingParams, Tokenizer, TruncationParams};

use crate::config::ModelSource;
use crate::engine::Engine;
use crate::types::{Sentiment, SentimentScores};

#[derive(Debug, Clone)]
pub struct XlmRobertaConfig {
    pub source: ModelSource,
    pub tokenizer_file: String,
    pub use_pth: bool,
    pub cpu: bool,
    pub max_sequence_length: usize,
}

struct ModelFiles {
    config: PathBuf,
    tokenizer: PathBuf,
    weights: PathBuf,
}

struct LoadedModel {
    model: XLMRobertaForSequenceClassification,
    tokenizer: Tokenizer,
    device: Device,
}

/// Sentiment classifier backed by a fine-tuned XLM-RoBERTa checkpoint.
///
/// Loaded once; every request shares the same read-only model.
#[derive(Clone)]
pub struct XlmRobertaEngine {
    inner: Arc<LoadedModel>,
}

impl XlmRobertaEngine {
    fn device(cpu: bool) -> Result<Device> {
        if cpu {
            Ok(Device::Cpu)
        } else if metal_is_available() {
            tracing::info!("Using metal acceleration");
            Ok(Device::new_metal(0)?)
        } else if cuda_is_available() {
            tracing::info!("Using CUDA GPU acceleration");
            Ok(Device::new_cuda(0)?)
        } else {
            tracing::info!(
                "CUDA not available, running on CPU. To run on GPU, build with `--features cuda`"
            );
            Ok(Device::Cpu)
        }
    }

    async fn resolve_files(config: &XlmRobertaConfig) -> Result<ModelFiles> {
        let weights_name = if config.use_pth {
            "pytorch_model.bin"
        } else {
            "model.safetensors"
        };

        match &config.source {
            ModelSource::Local(base_path) => {
                if !base_path.is_dir() {
                    bail!("Model path {} is not a directory.", base_path.display());
                }
                Ok(ModelFiles {
                    config: base_path.join("config.json"),
                    tokenizer: base_path.join(&config.tokenizer_file),
                    weights: base_path.join(weights_name),
                })
            }
            ModelSource::Hub { model_id, revision } => {
                let repo = Repo::with_revision(model_id.clone(), RepoType::Model, revision.clone());
                let api = Api::new()?.repo(repo);
                Ok(ModelFiles {
                    config: api.get("config.json").await?,
                    tokenizer: api.get(&config.tokenizer_file).await?,
                    weights: api.get(weights_name).await?,
                })
            }
        }
    }

    #[tracing::instrument(skip(config), fields(source = ?config.source, cpu = config.cpu))]
    pub async fn new(config: XlmRobertaConfig) -> Result<Self> {
        let device = Self::device(config.cpu)?;
        let files = Self::resolve_files(&config).await?;

        let config_str =
            std::fs::read_to_string(&files.config).context("Failed to read model config")?;
        let model_config: XLMRobertaConfig =
            serde_json::from_str(&config_str).context("Failed to parse XLM-RoBERTa config")?;
        let raw_config: serde_json::Value = serde_json::from_str(&config_str)?;
        check_labels(&raw_config)?;

        let max_length = effective_max_length(
            model_config.max_position_embeddings,
            model_config.pad_token_id as usize,
            config.max_sequence_length,
        );
        tracing::debug!(max_length, "Truncation length");

        let mut tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;
        configure_tokenizer(&mut tokenizer, max_length)?;

        let vb = if config.use_pth {
            VarBuilder::from_pth(&files.weights, DType::F32, &device)?
        } else {
            // SAFETY: the weights file is not modified while the model is mapped.
            unsafe { VarBuilder::from_mmaped_safetensors(&[&files.weights], DType::F32, &device)? }
        };
        let model =
            XLMRobertaForSequenceClassification::new(Sentiment::ORDER.len(), &model_config, vb)
                .context("Failed to construct XLM-RoBERTa classifier")?;

        Ok(Self {
            inner: Arc::new(LoadedModel {
                model,
                tokenizer,
                device,
            }),
        })
    }
}

/// Longest token sequence the model accepts. Positions start at
/// `pad_token_id + 1`, so this is shorter than the embedding table.
fn effective_max_length(
    max_position_embeddings: usize,
    pad_token_id: usize,
    requested: usize,
) -> usize {
    requested.min(max_position_embeddings.saturating_sub(pad_token_id + 1))
}

fn configure_tokenizer(tokenizer: &mut Tokenizer, max_length: usize) -> Result<()> {
    tokenizer.with_padding(Some(PaddingParams::default()));
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length,
            ..Default::default()
        }))
        .map_err(|e| anyhow::anyhow!("Tokenizer truncation error: {e}"))?;
    Ok(())
}

/// Softmax over the class dimension of `[1, 3]` logits.
fn scores_from_logits(logits: &Tensor) -> Result<SentimentScores> {
    let probs = softmax(logits, 1)?.squeeze(0)?.to_vec1::<f32>()?;
    SentimentScores::from_slice(&probs)
}

/// The classifier head must have exactly the three sentiment classes.
fn check_labels(raw_config: &serde_json::Value) -> Result<()> {
    let Some(id2label) = raw_config.get("id2label").and_then(|v| v.as_object()) else {
        tracing::warn!("config.json has no id2label, assuming NEG/POS/NEU");
        return Ok(());
    };

    if id2label.len() != Sentiment::ORDER.len() {
        bail!(
            "Model has {} labels, expected {}",
            id2label.len(),
            Sentiment::ORDER.len()
        );
    }

    for (index, sentiment) in Sentiment::ORDER.iter().enumerate() {
        let name = id2label.get(&index.to_string()).and_then(|v| v.as_str());
        if name != Some(sentiment.as_str()) {
            tracing::warn!(
                index,
                model_label = ?name,
                expected = sentiment.as_str(),
                "Model label differs from the fixed order"
            );
        }
    }
    Ok(())
}

/// Flags the blocking task once the awaiting request is gone.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

impl LoadedModel {
    #[tracing::instrument(skip(self, text, cancelled), fields(text_len = text.len()))]
    fn predict(&self, text: &str, cancelled: &AtomicBool) -> Result<SentimentScores> {
        if cancelled.load(Ordering::Relaxed) {
            bail!("Request dropped before tokenization");
        }
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        tracing::debug!(tokens = encoding.get_ids().len(), "Encoded input");

        let input_ids = Tensor::new(encoding.get_ids(), &self.device)?.unsqueeze(0)?;
        let attention_mask = Tensor::new(encoding.get_attention_mask(), &self.device)?.unsqueeze(0)?;
        let token_type_ids = input_ids.zeros_like()?;

        // The forward pass itself cannot be interrupted.
        if cancelled.load(Ordering::Relaxed) {
            bail!("Request dropped before the forward pass");
        }
        let logits = self
            .model
            .forward(&input_ids, &attention_mask, &token_type_ids)?;

        scores_from_logits(&logits)
    }
}

#[async_trait]
impl Engine for XlmRobertaEngine {
    async fn predict(&self, text: String) -> Result<SentimentScores> {
        let inner = Arc::clone(&self.inner);
        let cancelled = Arc::new(AtomicBool::new(false));
        let _guard = CancelOnDrop(Arc::clone(&cancelled));
        tokio::task::spawn_blocking(move || inner.predict(&text, &cancelled)).await?
    }
}
