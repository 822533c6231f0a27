use std::{fs, path::Path, time::Instant};

use parking_lot::Mutex;
use tch::{Device, Kind, Tensor, no_grad};
use tokenizers::Tokenizer;

use crate::{
    adapter::{LoraAdapter, resolve_adapter_dir},
    config::AppConfig,
    error::ServiceError,
    model::{Completion, GenerationSettings, ModelMetadata},
    prompt::ChatTemplate,
};

/// Stop markers used by Llama 3 chat models.
const LLAMA3_STOP_TOKENS: [&str; 3] = ["<|eot_id|>", "<|end_of_text|>", "<|eom_id|>"];

pub struct ModelArtifacts {
    pub tokenizer: Tokenizer,
    pub template: ChatTemplate,
    pub model: ModelInstance,
    stop_ids: Vec<i64>,
}

struct AdapterInfo {
    id: String,
    merged_modules: usize,
    rank: usize,
}

pub struct ModelInstance {
    name: String,
    size_bytes: u64,
    device: Device,
    adapter: Option<AdapterInfo>,
    module: Mutex<tch::CModule>,
}

impl ModelArtifacts {
    pub fn load(config: &AppConfig) -> Result<Self, ServiceError> {
        let tokenizer = load_tokenizer(config)?;

        let template = if config.tokenizer_config_path.exists() {
            ChatTemplate::from_tokenizer_config(&config.tokenizer_config_path)?
        } else {
            tracing::warn!(
                path = %config.tokenizer_config_path.display(),
                "tokenizer_config.json not found, using built-in Llama 3 chat template"
            );
            ChatTemplate::llama3()
        };

        let stop_ids = resolve_stop_ids(&tokenizer, template.eos_token());
        if stop_ids.is_empty() {
            tracing::warn!("tokenizer knows none of the stop tokens, generation runs to budget");
        }

        let mut model = ModelInstance::new(
            &config.base_model_id,
            &config.base_module_path,
            config.device(),
        )?;
        model.apply_adapter(&config.adapter_id, &config.adapter_path)?;

        Ok(Self {
            tokenizer,
            template,
            model,
            stop_ids,
        })
    }

    /// Renders, encodes, generates and decodes one chat turn. Blocking.
    pub fn complete(
        &self,
        prompt: &str,
        settings: GenerationSettings,
    ) -> Result<Completion, ServiceError> {
        // The rendered template already carries BOS.
        let encoding = self
            .tokenizer
            .encode(prompt, false)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        if input_ids.is_empty() {
            return Err(ServiceError::Tokenizer("prompt encoded to zero tokens".into()));
        }
        let prompt_tokens = input_ids.len();

        let start = Instant::now();
        let (generated, truncated) = self.model.generate(input_ids, &self.stop_ids, settings)?;
        let elapsed = start.elapsed();

        let generated_ids: Vec<u32> = generated.iter().map(|&id| id as u32).collect();
        let text = self
            .tokenizer
            .decode(&generated_ids, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;

        let tokens_generated = generated_ids.len();
        let tokens_per_second = if elapsed.as_secs_f64() > 0.0 {
            tokens_generated as f64 / elapsed.as_secs_f64()
        } else {
            tokens_generated as f64
        };

        Ok(Completion {
            text,
            prompt_tokens,
            tokens_generated,
            truncated,
            total_time_ms: elapsed.as_millis(),
            tokens_per_second,
        })
    }
}

/// Ids of the Llama 3 stop markers plus `eos_token`, whichever the tokenizer knows.
fn resolve_stop_ids(tokenizer: &Tokenizer, eos_token: &str) -> Vec<i64> {
    let mut stop_ids: Vec<i64> = LLAMA3_STOP_TOKENS
        .iter()
        .copied()
        .chain(std::iter::once(eos_token))
        .filter_map(|token| tokenizer.token_to_id(token))
        .map(i64::from)
        .collect();
    stop_ids.sort_unstable();
    stop_ids.dedup();
    stop_ids
}

fn load_tokenizer(config: &AppConfig) -> Result<Tokenizer, ServiceError> {
    if config.tokenizer_path.exists() {
        return Tokenizer::from_file(config.tokenizer_path.as_path())
            .map_err(|e| ServiceError::Tokenizer(e.to_string()));
    }
    tracing::info!(
        model = %config.base_model_id,
        "tokenizer file not found locally, fetching from the hub"
    );
    Tokenizer::from_pretrained(&config.base_model_id, None)
        .map_err(|e| ServiceError::Tokenizer(e.to_string()))
}

impl ModelInstance {
    pub fn new(name: &str, module_path: &Path, device: Device) -> Result<Self, ServiceError> {
        if !module_path.exists() {
            return Err(ServiceError::MissingArtifact(
                module_path.display().to_string(),
            ));
        }
        let size_bytes = fs::metadata(module_path)?.len();
        let mut module = tch::CModule::load_on_device(module_path, device)?;
        module.set_eval();

        Ok(Self {
            name: name.to_string(),
            size_bytes,
            device,
            adapter: None,
            module: Mutex::new(module),
        })
    }

    fn apply_adapter(&mut self, adapter_id: &str, dir: &Path) -> Result<(), ServiceError> {
        let dir = resolve_adapter_dir(adapter_id, dir)?;
        let adapter = LoraAdapter::load(&dir)?;
        if let Some(base) = adapter.config.base_model_name_or_path.as_deref() {
            if base != self.name {
                tracing::warn!(adapter_base = %base, model = %self.name, "adapter was trained on a different base model");
            }
        }
        let summary = adapter.merge_into(self.module.get_mut())?;
        tracing::info!(
            adapter = %adapter_id,
            merged = summary.merged_modules,
            rank = summary.rank,
            scaling = summary.scaling,
            "LoRA adapter merged"
        );
        self.adapter = Some(AdapterInfo {
            id: adapter_id.to_string(),
            merged_modules: summary.merged_modules,
            rank: summary.rank,
        });
        Ok(())
    }

    pub fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            base_model: self.name.clone(),
            adapter: self.adapter.as_ref().map(|a| a.id.clone()),
            merged_modules: self.adapter.as_ref().map_or(0, |a| a.merged_modules),
            lora_rank: self.adapter.as_ref().map(|a| a.rank),
            device: format!("{:?}", self.device),
            size_bytes: self.size_bytes,
        }
    }

    /// Runs the traced forward pass over the whole sequence for each new token.
    fn generate(
        &self,
        input_ids: Vec<i64>,
        stop_ids: &[i64],
        settings: GenerationSettings,
    ) -> Result<(Vec<i64>, bool), ServiceError> {
        no_grad(|| {
            let module = self.module.lock();
            decode_loop(input_ids, stop_ids, settings, |ids| {
                let input_tensor = Tensor::from_slice(ids)
                    .reshape([1, ids.len() as i64])
                    .to(self.device);

                // Traced causal LMs return either bare logits or a tuple led by logits.
                let output = module.forward_is(&[tch::IValue::Tensor(input_tensor)])?;
                let logits = match output {
                    tch::IValue::Tensor(t) => t,
                    tch::IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
                        tch::IValue::Tensor(t) => t.shallow_clone(),
                        _ => {
                            return Err(ServiceError::Inference(
                                "expected tensor as first tuple element".into(),
                            ));
                        }
                    },
                    _ => {
                        return Err(ServiceError::Inference(
                            "unexpected model output format".into(),
                        ));
                    }
                };

                // [1, seq_len, vocab] -> [vocab]
                Ok(logits.select(1, -1).squeeze())
            })
        })
    }
}

/// Autoregressive decoding. `next_logits` maps the sequence so far to the
/// vocabulary logits of the next position. Returns the new token ids (stop
/// token excluded) and whether the budget ran out before a stop token.
fn decode_loop<F>(
    mut input_ids: Vec<i64>,
    stop_ids: &[i64],
    settings: GenerationSettings,
    mut next_logits: F,
) -> Result<(Vec<i64>, bool), ServiceError>
where
    F: FnMut(&[i64]) -> Result<Tensor, ServiceError>,
{
    let prompt_len = input_ids.len();

    for _ in 0..settings.max_new_tokens {
        let logits = next_logits(&input_ids)?;
        let next_token_id = select_next_token(&logits, settings)?;
        if stop_ids.contains(&next_token_id) {
            return Ok((input_ids.split_off(prompt_len), false));
        }
        input_ids.push(next_token_id);
    }

    Ok((input_ids.split_off(prompt_len), true))
}

fn select_next_token(logits: &Tensor, settings: GenerationSettings) -> Result<i64, ServiceError> {
    if settings.temperature <= 0.0 {
        return Ok(logits.f_argmax(0, false)?.int64_value(&[]));
    }

    let vocab = logits.size().first().copied().unwrap_or(1);
    let k = (settings.top_k as i64).clamp(1, vocab.max(1));
    let scaled = logits
        .to_kind(Kind::Float)
        .f_div_scalar(settings.temperature)?;
    let (values, indices) = scaled.f_topk(k, -1, true, true)?;
    let probs = values.f_softmax(-1, Kind::Float)?;
    let choice = probs.f_multinomial(1, false)?;
    Ok(indices.f_gather(0, &choice, false)?.int64_value(&[0]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn greedy(max_new_tokens: usize) -> GenerationSettings {
        GenerationSettings {
            max_new_tokens,
            temperature: 0.0,
            top_k: 50,
        }
    }

    fn one_hot(vocab: usize, hot: usize) -> Tensor {
        let mut values = vec![0.0f32; vocab];
        values[hot] = 5.0;
        Tensor::from_slice(&values)
    }

    #[test]
    fn greedy_picks_argmax() {
        let logits = Tensor::from_slice(&[0.1f32, 2.5, -1.0, 2.4]);
        assert_eq!(select_next_token(&logits, greedy(1)).unwrap(), 1);
    }

    #[test]
    fn top_k_larger_than_vocab_is_clamped() {
        let logits = Tensor::from_slice(&[0.3f32, 0.2, 0.1]);
        let settings = GenerationSettings {
            max_new_tokens: 1,
            temperature: 1.0,
            top_k: 1000,
        };
        for _ in 0..20 {
            let id = select_next_token(&logits, settings).unwrap();
            assert!((0..3).contains(&id));
        }
    }

    #[test]
    fn top_k_of_one_is_greedy() {
        let logits = Tensor::from_slice(&[0.3f32, 4.0, 0.1]);
        let settings = GenerationSettings {
            max_new_tokens: 1,
            temperature: 0.7,
            top_k: 1,
        };
        assert_eq!(select_next_token(&logits, settings).unwrap(), 1);
    }

    #[test]
    fn stop_token_ends_generation_without_being_emitted() {
        let script = [4usize, 5, 9, 6];
        let mut step = 0;
        let (generated, truncated) = decode_loop(vec![1, 2], &[9], greedy(10), |ids| {
            assert_eq!(ids.len(), 2 + step);
            let logits = one_hot(10, script[step]);
            step += 1;
            Ok(logits)
        })
        .unwrap();

        assert_eq!(generated, vec![4, 5]);
        assert!(!truncated);
    }

    #[test]
    fn budget_exhaustion_marks_truncation() {
        let (generated, truncated) =
            decode_loop(vec![1], &[9], greedy(3), |_| Ok(one_hot(10, 7))).unwrap();
        assert_eq!(generated, vec![7, 7, 7]);
        assert!(truncated);
    }

    #[test]
    fn forward_errors_propagate() {
        let err = decode_loop(vec![1], &[9], greedy(3), |_| {
            Err(ServiceError::Inference("boom".into()))
        })
        .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn stop_ids_come_from_known_tokens() {
        let tokenizer: Tokenizer = r#"{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": null,
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": {"[UNK]": 0, "hello": 1, "<|eot_id|>": 7, "<|end_of_text|>": 3, "</s>": 5},
                "unk_token": "[UNK]"
            }
        }"#
        .parse()
        .unwrap();

        assert_eq!(resolve_stop_ids(&tokenizer, "<|eot_id|>"), vec![3, 7]);
        assert_eq!(resolve_stop_ids(&tokenizer, "</s>"), vec![3, 5, 7]);
        assert_eq!(resolve_stop_ids(&tokenizer, "<missing>"), vec![3, 7]);
    }
}
