//! Completion defaults, persisted between sessions.

use std::sync::Arc;

use async_trait::async_trait;
use hearth_local_ai::{ChatMessage, CompletionRequest, SamplingParameters};
use hearth_store::{
    load_json, save_json, KeyValueStore, Readiness, Resource, ResourceStore, StoreError,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::SessionError;

/// Key the chat configuration is persisted under.
pub const CHAT_CONFIG_KEY: &str = "nitro-config";

/// Parameters sent with every completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Model alias reported to the server.
    pub model: String,
    pub max_tokens: u32,
    pub stop: Vec<String>,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub temperature: f32,
    pub top_p: f32,
    pub context_length: u32,
    pub stream: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: "tinyllama-1.1b".to_string(),
            max_tokens: 2048,
            stop: Vec::new(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            temperature: 0.7,
            top_p: 0.95,
            context_length: 4096,
            stream: false,
        }
    }
}

impl ChatConfig {
    /// Build a request for `messages`, with a model's parameters taking
    /// precedence over these defaults.
    pub fn request(
        &self,
        messages: Vec<ChatMessage>,
        parameters: Option<&SamplingParameters>,
    ) -> CompletionRequest {
        let default = SamplingParameters::default();
        let p = parameters.unwrap_or(&default);
        CompletionRequest {
            messages,
            model: self.model.clone(),
            max_tokens: p.max_tokens.unwrap_or(self.max_tokens),
            stop: p.stop.clone().unwrap_or_else(|| self.stop.clone()),
            frequency_penalty: p.frequency_penalty.unwrap_or(self.frequency_penalty),
            presence_penalty: p.presence_penalty.unwrap_or(self.presence_penalty),
            temperature: p.temperature.unwrap_or(self.temperature),
            top_p: p.top_p.unwrap_or(self.top_p),
            context_length: self.context_length,
            stream: p.stream.unwrap_or(self.stream),
        }
    }
}

/// A partial update of [`ChatConfig`]; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatConfigPatch {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub stop: Option<Vec<String>>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub context_length: Option<u32>,
    pub stream: Option<bool>,
}

impl ChatConfigPatch {
    fn apply(self, config: &mut ChatConfig) {
        if let Some(model) = self.model {
            config.model = model;
        }
        if let Some(max_tokens) = self.max_tokens {
            config.max_tokens = max_tokens;
        }
        if let Some(stop) = self.stop {
            config.stop = stop;
        }
        if let Some(v) = self.frequency_penalty {
            config.frequency_penalty = v;
        }
        if let Some(v) = self.presence_penalty {
            config.presence_penalty = v;
        }
        if let Some(v) = self.temperature {
            config.temperature = v;
        }
        if let Some(v) = self.top_p {
            config.top_p = v;
        }
        if let Some(v) = self.context_length {
            config.context_length = v;
        }
        if let Some(v) = self.stream {
            config.stream = v;
        }
    }
}

/// Holds the [`ChatConfig`].
pub struct ChatConfigStore {
    store: ResourceStore<ChatConfig>,
    storage: Arc<dyn KeyValueStore>,
}

impl ChatConfigStore {
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store: ResourceStore::new("config", ChatConfig::default()),
            storage,
        }
    }

    /// Current configuration.
    pub fn config(&self) -> ChatConfig {
        self.store.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatConfig> {
        self.store.subscribe()
    }

    /// Merge `patch` into the configuration and persist the result.
    pub async fn set_config(&self, patch: ChatConfigPatch) -> Result<ChatConfig, SessionError> {
        self.store.update(|config| patch.apply(config));
        let config = self.config();
        save_json(self.storage.as_ref(), CHAT_CONFIG_KEY, &config).await?;
        debug!("Chat config updated: {:?}", config);
        Ok(config)
    }
}

#[async_trait]
impl Resource for ChatConfigStore {
    type Error = SessionError;

    fn name(&self) -> &'static str {
        self.store.name()
    }

    fn readiness(&self) -> Readiness {
        self.store.ready().clone()
    }

    async fn init(&self) -> Result<(), SessionError> {
        self.store.activate();
        match load_json::<ChatConfig>(self.storage.as_ref(), CHAT_CONFIG_KEY).await {
            Ok(Some(config)) => self.store.set(config),
            Ok(None) => {}
            Err(StoreError::Json(e)) => warn!("Ignoring unreadable chat config: {}", e),
            Err(e) => return Err(e.into()),
        }
        self.store.ready().set(true);
        Ok(())
    }

    async fn dispose(&self) {
        self.store.release();
    }
}
