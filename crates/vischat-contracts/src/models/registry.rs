use std::path::Path;

use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// One configured text-generation endpoint.
///
/// `config` is merged into every request body for this model, which is where
/// the provider-side model name, temperature and similar knobs live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, rename = "supportVision", alias = "support_vision")]
    pub supports_vision: bool,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl ModelSpec {
    pub fn configured_key(&self) -> Option<&str> {
        self.key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(|| default_models(DEFAULT_OPENAI_API_BASE)),
        }
    }

    /// Built-in models with the OpenAI endpoints rooted at `api_base`.
    pub fn with_api_base(api_base: &str) -> Self {
        Self {
            models: default_models(api_base),
        }
    }

    pub fn from_specs(specs: Vec<ModelSpec>) -> Self {
        let mut models = IndexMap::new();
        for spec in specs {
            models.insert(spec.name.clone(), spec);
        }
        Self { models }
    }

    /// Reads a JSON array of model records. Later records replace earlier
    /// ones with the same name but keep the first position.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading model registry {}", path.display()))?;
        let specs: Vec<ModelSpec> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid model registry {}", path.display()))?;
        Ok(Self::from_specs(specs))
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn vision_models(&self) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports_vision)
            .cloned()
            .collect()
    }

    pub fn ensure_vision(&self, name: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports_vision {
            return Some(model.clone());
        }
        None
    }
}

fn default_models(api_base: &str) -> IndexMap<String, ModelSpec> {
    let api_base = api_base.trim().trim_end_matches('/');
    let completions = format!("{api_base}/chat/completions");
    let mut map = IndexMap::new();

    let mut insert = |name: &str, provider: &str, url: &str, supports_vision: bool, config: Value| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
                url: url.to_string(),
                key: None,
                supports_vision,
                config: config.as_object().cloned().unwrap_or_default(),
            },
        );
    };

    insert("dryrun-vision-1", "dryrun", "dryrun://local", true, json!({}));
    insert(
        "gpt-4o-mini",
        "openai",
        &completions,
        true,
        json!({"model": "gpt-4o-mini"}),
    );
    insert(
        "gpt-4o",
        "openai",
        &completions,
        true,
        json!({"model": "gpt-4o"}),
    );
    insert(
        "gpt-4.1-mini",
        "openai",
        &completions,
        true,
        json!({"model": "gpt-4.1-mini"}),
    );
    insert(
        "gpt-3.5-turbo",
        "openai",
        &completions,
        false,
        json!({"model": "gpt-3.5-turbo"}),
    );

    map
}
