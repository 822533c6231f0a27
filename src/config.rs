use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

#[cfg(feature = "tch-backend")]
use tch::Device;

pub const DEFAULT_BASE_MODEL_ID: &str = "akjindal53244/Llama-3.1-Storm-8B";
pub const DEFAULT_ADAPTER_ID: &str = "LlamaFactoryAI/cv-job-description-matching";
pub const DEFAULT_MAX_NEW_TOKENS: usize = 128;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub base_model_id: String,
    pub base_module_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub tokenizer_config_path: PathBuf,
    pub adapter_id: String,
    pub adapter_path: PathBuf,
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_k: usize,
    pub device_name: String,
    pub cors_allow_any: bool,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. Unparsable values fall
    /// back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = lookup("SERVER_ADDR")
            .unwrap_or_else(|| "127.0.0.1:5000".into())
            .parse()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5000));

        let base_model_id =
            lookup("BASE_MODEL_ID").unwrap_or_else(|| DEFAULT_BASE_MODEL_ID.to_string());
        let base_module_path = PathBuf::from(
            lookup("BASE_MODULE_PATH")
                .unwrap_or_else(|| "models/llama-3.1-storm-8b.ts".to_string()),
        );
        let tokenizer_path = PathBuf::from(
            lookup("TOKENIZER_PATH").unwrap_or_else(|| "models/tokenizer.json".to_string()),
        );
        let tokenizer_config_path = PathBuf::from(
            lookup("TOKENIZER_CONFIG_PATH")
                .unwrap_or_else(|| "models/tokenizer_config.json".to_string()),
        );

        let adapter_id = lookup("ADAPTER_ID").unwrap_or_else(|| DEFAULT_ADAPTER_ID.to_string());
        let adapter_path = PathBuf::from(
            lookup("ADAPTER_PATH")
                .unwrap_or_else(|| "models/cv-job-description-matching".to_string()),
        );

        let max_new_tokens = lookup("MAX_NEW_TOKENS")
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(DEFAULT_MAX_NEW_TOKENS);
        let temperature = lookup("TEMPERATURE")
            .and_then(|v| v.parse().ok())
            .filter(|t: &f64| t.is_finite() && *t >= 0.0)
            .unwrap_or(0.0);
        let top_k = lookup("TOP_K")
            .and_then(|v| v.parse().ok())
            .filter(|k: &usize| *k > 0)
            .unwrap_or(50);

        let device_name = lookup("DEVICE")
            .map(|raw| raw.trim().to_lowercase())
            .filter(|raw| !raw.is_empty())
            .unwrap_or_else(|| "cpu".into());
        let cors_allow_any = lookup("CORS_ALLOW_ANY")
            .map(|v| parse_flag(&v))
            .unwrap_or(false);

        Ok(Self {
            listen_addr,
            base_model_id,
            base_module_path,
            tokenizer_path,
            tokenizer_config_path,
            adapter_id,
            adapter_path,
            max_new_tokens,
            temperature,
            top_k,
            device_name,
            cors_allow_any,
        })
    }

    #[cfg(feature = "tch-backend")]
    pub fn device(&self) -> Device {
        parse_device(&self.device_name)
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(feature = "tch-backend")]
fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower == "cpu" {
        Device::Cpu
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            Device::Cuda(idx)
        } else {
            tracing::warn!(requested = %raw, "CUDA unavailable, falling back to CPU");
            Device::Cpu
        }
    } else {
        Device::Cpu
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> AppConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned()).unwrap()
    }

    #[test]
    fn defaults_target_the_storm_model_and_matching_adapter() {
        let config = config_from(&[]);
        assert_eq!(config.listen_addr, "127.0.0.1:5000".parse().unwrap());
        assert_eq!(config.base_model_id, DEFAULT_BASE_MODEL_ID);
        assert_eq!(config.adapter_id, DEFAULT_ADAPTER_ID);
        assert_eq!(config.max_new_tokens, 128);
        assert_eq!(config.temperature, 0.0);
        assert_eq!(config.device_name, "cpu");
        assert!(!config.cors_allow_any);
    }

    #[test]
    fn overrides_are_applied() {
        let config = config_from(&[
            ("SERVER_ADDR", "0.0.0.0:9000"),
            ("MAX_NEW_TOKENS", "512"),
            ("TEMPERATURE", "0.7"),
            ("TOP_K", "20"),
            ("DEVICE", " CUDA:1 "),
            ("CORS_ALLOW_ANY", "yes"),
            ("ADAPTER_PATH", "/srv/adapter"),
        ]);
        assert_eq!(config.listen_addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.max_new_tokens, 512);
        assert_eq!(config.temperature, 0.7);
        assert_eq!(config.top_k, 20);
        assert_eq!(config.device_name, "cuda:1");
        assert!(config.cors_allow_any);
        assert_eq!(config.adapter_path, PathBuf::from("/srv/adapter"));
    }

    #[test]
    fn garbage_values_fall_back_to_defaults() {
        let config = config_from(&[
            ("SERVER_ADDR", "not-an-addr"),
            ("MAX_NEW_TOKENS", "0"),
            ("TEMPERATURE", "-1"),
            ("TOP_K", "lots"),
        ]);
        assert_eq!(config.listen_addr.port(), 5000);
        assert_eq!(config.max_new_tokens, 128);
        assert_eq!(config.temperature, 0.0);
        assert_eq!(config.top_k, 50);
    }
}
