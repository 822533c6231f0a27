//! LoRA adapter loading and merging into the base model's weights.
//!
//! A PEFT checkpoint stores, for each targeted linear layer, a down projection
//! `lora_A` (`r x in`) and an up projection `lora_B` (`out x r`). Merging folds
//! `scaling * B @ A` into the frozen base weight so generation runs at base-model
//! cost.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::error::ServiceError;

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

const PEFT_PREFIX: &str = "base_model.model.";

#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub target_modules: TargetModules,
    #[serde(default)]
    pub use_rslora: bool,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
    #[serde(default)]
    pub peft_type: Option<String>,
}

/// PEFT accepts either an explicit module list or a single name/regex
/// (`"all-linear"`, `".*proj"`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TargetModules {
    List(Vec<String>),
    Pattern(String),
}

impl Default for TargetModules {
    fn default() -> Self {
        TargetModules::List(Vec::new())
    }
}

impl AdapterConfig {
    pub fn from_file(path: &Path) -> Result<Self, ServiceError> {
        let raw = fs::read_to_string(path)?;
        let config: AdapterConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ServiceError> {
        if let Some(kind) = self.peft_type.as_deref() {
            if !kind.eq_ignore_ascii_case("lora") {
                return Err(ServiceError::Adapter(format!(
                    "unsupported peft_type {kind}, only LORA can be merged"
                )));
            }
        }
        if self.r == 0 {
            return Err(ServiceError::Adapter("adapter rank must be non-zero".into()));
        }
        Ok(())
    }

    pub fn scaling(&self) -> f64 {
        if self.use_rslora {
            self.lora_alpha / (self.r as f64).sqrt()
        } else {
            self.lora_alpha / self.r as f64
        }
    }

    /// Targeted module names (`q_proj`, ...) with no merged pair among `merged`.
    /// Only an explicit list can be checked.
    pub fn unmatched_targets<'a>(&self, merged: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let TargetModules::List(targets) = &self.target_modules else {
            return Vec::new();
        };
        let present: BTreeSet<&str> = merged.into_iter().filter_map(module_kind).collect();
        targets
            .iter()
            .filter(|target| !present.contains(target.as_str()))
            .cloned()
            .collect()
    }
}

/// `model.layers.0.self_attn.q_proj.weight` -> `q_proj`
fn module_kind(parameter: &str) -> Option<&str> {
    parameter.strip_suffix(".weight")?.rsplit('.').next()
}

/// Returns `dir` when it exists, otherwise downloads the adapter files for
/// `adapter_id` from the HuggingFace hub and returns their snapshot directory.
pub fn resolve_adapter_dir(adapter_id: &str, dir: &Path) -> Result<PathBuf, ServiceError> {
    if dir.exists() {
        return Ok(dir.to_path_buf());
    }
    tracing::info!(
        adapter = %adapter_id,
        path = %dir.display(),
        "adapter directory not found locally, fetching from the hub"
    );

    let hub_err = |e: hf_hub::api::sync::ApiError| ServiceError::Hub(format!("{adapter_id}: {e}"));
    let repo = hf_hub::api::sync::Api::new()
        .map_err(hub_err)?
        .model(adapter_id.to_string());
    let config_path = repo.get(ADAPTER_CONFIG_FILE).map_err(hub_err)?;
    repo.get(ADAPTER_WEIGHTS_FILE).map_err(hub_err)?;

    config_path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| ServiceError::Hub(format!("{adapter_id}: snapshot has no parent directory")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoraSide {
    A,
    B,
}

/// Maps a PEFT tensor key to the base parameter it modifies.
///
/// `base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight` and
/// `...q_proj.lora_A.default.weight` both map to
/// `model.layers.0.self_attn.q_proj.weight`.
pub fn base_parameter_name(adapter_key: &str) -> Option<(String, LoraSide)> {
    let key = adapter_key.strip_prefix(PEFT_PREFIX).unwrap_or(adapter_key);
    let (module, rest) = key
        .split_once(".lora_A.")
        .map(|(m, r)| (m, (r, LoraSide::A)))
        .or_else(|| key.split_once(".lora_B.").map(|(m, r)| (m, (r, LoraSide::B))))?;
    let (suffix, side) = rest;
    match suffix {
        "weight" | "default.weight" => Some((format!("{module}.weight"), side)),
        _ => None,
    }
}

#[derive(Debug)]
pub struct LoraPair<T> {
    pub a: T,
    pub b: T,
}

/// Groups adapter tensors into A/B pairs keyed by base parameter name.
/// Keys that are not LoRA projections are skipped.
pub fn pair_lora_tensors<T>(
    tensors: impl IntoIterator<Item = (String, T)>,
) -> Result<BTreeMap<String, LoraPair<T>>, ServiceError> {
    let mut halves: BTreeMap<String, (Option<T>, Option<T>)> = BTreeMap::new();
    for (key, tensor) in tensors {
        let Some((param, side)) = base_parameter_name(&key) else {
            tracing::debug!(%key, "skipping non-LoRA adapter tensor");
            continue;
        };
        let entry = halves.entry(param).or_insert((None, None));
        match side {
            LoraSide::A => entry.0 = Some(tensor),
            LoraSide::B => entry.1 = Some(tensor),
        }
    }

    halves
        .into_iter()
        .map(|(param, halves)| match halves {
            (Some(a), Some(b)) => Ok((param, LoraPair { a, b })),
            (None, _) => Err(ServiceError::Adapter(format!("{param} has no lora_A"))),
            (_, None) => Err(ServiceError::Adapter(format!("{param} has no lora_B"))),
        })
        .collect()
}

#[cfg(feature = "tch-backend")]
pub use self::merge::{LoraAdapter, MergeSummary, apply_lora_delta};

#[cfg(feature = "tch-backend")]
mod merge {
    use std::{collections::HashMap, path::Path};

    use tch::{CModule, Kind, Tensor, no_grad};

    use super::{ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE, AdapterConfig, LoraPair};
    use crate::error::ServiceError;

    pub struct LoraAdapter {
        pub config: AdapterConfig,
        pairs: Vec<(String, LoraPair<Tensor>)>,
    }

    #[derive(Debug, Clone, Copy)]
    pub struct MergeSummary {
        pub merged_modules: usize,
        pub rank: usize,
        pub scaling: f64,
    }

    /// `weight += scaling * (B @ A)`, computed in f32 and cast back to the
    /// weight's kind and device.
    pub fn apply_lora_delta(
        name: &str,
        weight: &mut Tensor,
        pair: &LoraPair<Tensor>,
        scaling: f64,
    ) -> Result<(), ServiceError> {
        let delta = pair
            .b
            .to_kind(Kind::Float)
            .f_matmul(&pair.a.to_kind(Kind::Float))?
            .f_mul_scalar(scaling)?;
        if delta.size() != weight.size() {
            return Err(ServiceError::Adapter(format!(
                "{name}: delta shape {:?} does not match weight shape {:?}",
                delta.size(),
                weight.size()
            )));
        }

        let delta = delta.to_kind(weight.kind()).to_device(weight.device());
        no_grad(|| weight.f_add_(&delta))?;
        Ok(())
    }

    impl LoraAdapter {
        pub fn load(dir: &Path) -> Result<Self, ServiceError> {
            let config_path = dir.join(ADAPTER_CONFIG_FILE);
            let weights_path = dir.join(ADAPTER_WEIGHTS_FILE);
            for path in [&config_path, &weights_path] {
                if !path.exists() {
                    return Err(ServiceError::MissingArtifact(path.display().to_string()));
                }
            }

            let config = AdapterConfig::from_file(&config_path)?;
            let tensors = Tensor::read_safetensors(&weights_path)?;
            let pairs: Vec<_> = super::pair_lora_tensors(tensors)?.into_iter().collect();

            let unmatched = config.unmatched_targets(pairs.iter().map(|(name, _)| name.as_str()));
            if !unmatched.is_empty() {
                tracing::warn!(?unmatched, "adapter targets modules it carries no weights for");
            }

            Ok(Self { config, pairs })
        }

        /// Folds every pair into the module's parameters in place.
        pub fn merge_into(&self, module: &CModule) -> Result<MergeSummary, ServiceError> {
            let mut params: HashMap<String, Tensor> =
                module.named_parameters()?.into_iter().collect();
            self.merge_into_parameters(&mut params)
        }

        /// Parameters share storage with the module they were taken from.
        pub fn merge_into_parameters(
            &self,
            params: &mut HashMap<String, Tensor>,
        ) -> Result<MergeSummary, ServiceError> {
            let scaling = self.config.scaling();

            for (name, pair) in &self.pairs {
                let weight = params.get_mut(name).ok_or_else(|| {
                    ServiceError::Adapter(format!("base model has no parameter {name}"))
                })?;
                apply_lora_delta(name, weight, pair, scaling)?;
                tracing::debug!(parameter = %name, "merged LoRA delta");
            }

            Ok(MergeSummary {
                merged_modules: self.pairs.len(),
                rank: self.config.r,
                scaling,
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::adapter::TargetModules;

        fn matrix(values: &[f32], rows: i64, cols: i64) -> Tensor {
            Tensor::from_slice(values).reshape([rows, cols])
        }

        fn rank_one_pair() -> LoraPair<Tensor> {
            LoraPair {
                a: matrix(&[1.0, 2.0], 1, 2),
                b: matrix(&[1.0, 3.0], 2, 1),
            }
        }

        fn adapter(pairs: Vec<(String, LoraPair<Tensor>)>) -> LoraAdapter {
            LoraAdapter {
                config: AdapterConfig {
                    r: 1,
                    lora_alpha: 2.0,
                    target_modules: TargetModules::List(vec!["q_proj".into()]),
                    use_rslora: false,
                    base_model_name_or_path: None,
                    peft_type: Some("LORA".into()),
                },
                pairs,
            }
        }

        #[test]
        fn delta_is_scaled_outer_product() {
            let mut weight = matrix(&[1.0, 1.0, 1.0, 1.0], 2, 2);
            apply_lora_delta("w", &mut weight, &rank_one_pair(), 2.0).unwrap();

            // B @ A = [[1, 2], [3, 6]]
            assert_eq!(weight.double_value(&[0, 0]), 3.0);
            assert_eq!(weight.double_value(&[0, 1]), 5.0);
            assert_eq!(weight.double_value(&[1, 0]), 7.0);
            assert_eq!(weight.double_value(&[1, 1]), 13.0);
        }

        #[test]
        fn delta_shape_mismatch_is_rejected() {
            let mut weight = matrix(&[0.0; 9], 3, 3);
            let err = apply_lora_delta("w", &mut weight, &rank_one_pair(), 1.0).unwrap_err();
            assert!(matches!(err, ServiceError::Adapter(_)));
            assert_eq!(weight.double_value(&[0, 0]), 0.0);
        }

        #[test]
        fn merge_updates_shared_parameter_storage() {
            let name = "model.layers.0.self_attn.q_proj.weight".to_string();
            let original = matrix(&[0.0; 4], 2, 2);
            let mut params = HashMap::from([(name.clone(), original.shallow_clone())]);

            let summary = adapter(vec![(name, rank_one_pair())])
                .merge_into_parameters(&mut params)
                .unwrap();

            assert_eq!(summary.merged_modules, 1);
            assert_eq!(summary.rank, 1);
            assert_eq!(summary.scaling, 2.0);
            assert_eq!(original.double_value(&[1, 1]), 12.0);
        }

        #[test]
        fn merge_requires_matching_parameter() {
            let mut params = HashMap::from([(
                "model.layers.0.self_attn.k_proj.weight".to_string(),
                matrix(&[0.0; 4], 2, 2),
            )]);
            let err = adapter(vec![(
                "model.layers.0.self_attn.q_proj.weight".to_string(),
                rank_one_pair(),
            )])
            .merge_into_parameters(&mut params)
            .unwrap_err();
            assert!(err.to_string().contains("no parameter model.layers.0.self_attn.q_proj.weight"));
        }
    }
}
