use serde::{Deserialize, Serialize};

/// Immutable capability record for one chat persona backed by a model.
///
/// Everything the composer and dispatcher need to branch on lives here, so
/// per-model behavior is data rather than conditionals scattered through the
/// pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub display_name: String,
    /// Model name as the inference backend knows it.
    pub backend_model: String,
    pub is_cloud: bool,
    pub supports_images: bool,
    /// Emits `<think>` reasoning the dispatcher streams and splits off.
    pub shows_thinking: bool,
    pub has_web_search: bool,
    /// Only usable for image description, never plain chat.
    pub vision_only: bool,
    /// Never downgraded to the reminder system prompt.
    pub always_full_prompt: bool,
    pub prompt_format: PromptFormat,
    /// `None` means unthrottled.
    pub daily_limit: Option<u64>,
    pub limit_kind: LimitKind,
    pub num_predict: u32,
    pub temperature: f64,
    /// Accent color for host UIs, 0xRRGGBB.
    pub color: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptFormat {
    /// Structured message list against the chat endpoint.
    Chat,
    /// Messages folded into a single prompt string for the generate endpoint.
    Flattened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitKind {
    Characters,
    Items,
}

/// Read-only lookup of model descriptors, built once at startup.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: Vec<ModelDescriptor>,
    default_id: String,
}

impl ModelRegistry {
    pub fn new(models: Vec<ModelDescriptor>, default_id: impl Into<String>) -> Self {
        Self {
            models,
            default_id: default_id.into(),
        }
    }

    /// The built-in persona set.
    pub fn defaults() -> Self {
        let models = vec![
            ModelDescriptor {
                id: "flint".into(),
                display_name: "Flint".into(),
                backend_model: "gemma3:27b-cloud".into(),
                is_cloud: true,
                supports_images: true,
                shows_thinking: false,
                has_web_search: false,
                vision_only: false,
                always_full_prompt: false,
                prompt_format: PromptFormat::Chat,
                daily_limit: None,
                limit_kind: LimitKind::Characters,
                num_predict: 1024,
                temperature: 0.9,
                color: 0x9B59B6,
            },
            ModelDescriptor {
                id: "oracle".into(),
                display_name: "Oracle".into(),
                backend_model: "nemotron-3-nano:30b-cloud".into(),
                is_cloud: true,
                supports_images: true,
                shows_thinking: true,
                has_web_search: true,
                vision_only: false,
                always_full_prompt: true,
                prompt_format: PromptFormat::Chat,
                daily_limit: Some(2500),
                limit_kind: LimitKind::Characters,
                num_predict: 1024,
                temperature: 0.9,
                color: 0x3498DB,
            },
            ModelDescriptor {
                id: "pyre".into(),
                display_name: "Pyre".into(),
                backend_model: "devstral-2:123b-cloud".into(),
                is_cloud: true,
                supports_images: false,
                shows_thinking: false,
                has_web_search: false,
                vision_only: false,
                always_full_prompt: true,
                prompt_format: PromptFormat::Flattened,
                daily_limit: None,
                limit_kind: LimitKind::Characters,
                num_predict: 3000,
                temperature: 0.9,
                color: 0xE74C3C,
            },
            ModelDescriptor {
                id: "prism".into(),
                display_name: "Prism".into(),
                backend_model: "gemma3:27b-cloud".into(),
                is_cloud: true,
                supports_images: true,
                shows_thinking: false,
                has_web_search: false,
                vision_only: true,
                always_full_prompt: true,
                prompt_format: PromptFormat::Chat,
                daily_limit: Some(5),
                limit_kind: LimitKind::Items,
                num_predict: 512,
                temperature: 0.9,
                color: 0xF39C12,
            },
        ];
        Self::new(models, "flint")
    }

    pub fn get(&self, id: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn default_model(&self) -> &str {
        &self.default_id
    }

    /// Models a user can chat with directly.
    pub fn chat_models(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.iter().filter(|m| !m.vision_only)
    }

    /// The model used to describe image attachments for the others.
    pub fn vision_model(&self) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.vision_only)
    }

    pub fn all(&self) -> &[ModelDescriptor] {
        &self.models
    }
}
