//! Model registry for the configured providers

use super::{AnthropicService, LlmError, LlmService, LoggingService, OpenAiService, Provider};
use crate::db::{Database, DbResult, ModelRole};
use std::collections::HashMap;
use std::sync::Arc;

/// Static model definition
pub struct ModelDef {
    pub id: &'static str,
    pub provider: Provider,
    pub api_name: &'static str,
    pub role: ModelRole,
    pub description: &'static str,
}

/// Every model this build knows how to talk to. Which of them are actually
/// registered depends on the API keys present at startup.
pub fn all_models() -> &'static [ModelDef] {
    &[
        ModelDef {
            id: "claude-3.5-sonnet",
            provider: Provider::Anthropic,
            api_name: "claude-3-5-sonnet-20241022",
            role: ModelRole::Planner,
            description: "Anthropic Claude for planning and reasoning tasks",
        },
        ModelDef {
            id: "claude-3.5-haiku",
            provider: Provider::Anthropic,
            api_name: "claude-3-5-haiku-20241022",
            role: ModelRole::Evaluator,
            description: "Fast Claude variant for plan evaluation",
        },
        ModelDef {
            id: "gpt-4o",
            provider: Provider::OpenAi,
            api_name: "gpt-4o",
            role: ModelRole::Planner,
            description: "OpenAI GPT-4o for general-purpose planning",
        },
        ModelDef {
            id: "gpt-4o-mini",
            provider: Provider::OpenAi,
            api_name: "gpt-4o-mini",
            role: ModelRole::Evaluator,
            description: "Small GPT variant for plan evaluation",
        },
    ]
}

/// Configuration for model providers
#[derive(Debug, Clone, Default)]
pub struct LlmConfig {
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub default_planner_model: Option<String>,
    pub default_evaluator_model: Option<String>,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            default_planner_model: std::env::var("DEFAULT_PLANNER_MODEL").ok(),
            default_evaluator_model: std::env::var("DEFAULT_EVALUATOR_MODEL").ok(),
        }
    }
}

/// Registry of available model services
pub struct ModelRegistry {
    services: HashMap<String, Arc<dyn LlmService>>,
    default_planner: Option<String>,
    default_evaluator: Option<String>,
}

impl ModelRegistry {
    /// Create an empty registry for testing purposes
    pub fn new_empty() -> Self {
        Self {
            services: HashMap::new(),
            default_planner: None,
            default_evaluator: None,
        }
    }

    pub fn new(config: &LlmConfig) -> Self {
        let mut services: HashMap<String, Arc<dyn LlmService>> = HashMap::new();

        for model_def in all_models() {
            if let Some(service) = Self::try_create_model(model_def, config) {
                services.insert(model_def.id.to_string(), service);
            }
        }

        let default_planner = config
            .default_planner_model
            .clone()
            .filter(|id| services.contains_key(id))
            .or_else(|| first_with_role(&services, ModelRole::Planner));
        let default_evaluator = config
            .default_evaluator_model
            .clone()
            .filter(|id| services.contains_key(id))
            .or_else(|| first_with_role(&services, ModelRole::Evaluator));

        Self {
            services,
            default_planner,
            default_evaluator,
        }
    }

    fn try_create_model(model_def: &ModelDef, config: &LlmConfig) -> Option<Arc<dyn LlmService>> {
        let api_key = match model_def.provider {
            Provider::Anthropic => config.anthropic_api_key.as_ref()?,
            Provider::OpenAi => config.openai_api_key.as_ref()?,
        }
        .clone();

        if api_key.is_empty() {
            return None;
        }

        let service: Result<Arc<dyn LlmService>, LlmError> = match model_def.provider {
            Provider::Anthropic => {
                AnthropicService::new(api_key, model_def.id, model_def.api_name)
                    .map(|s| Arc::new(s) as Arc<dyn LlmService>)
            }
            Provider::OpenAi => OpenAiService::new(api_key, model_def.id, model_def.api_name)
                .map(|s| Arc::new(s) as Arc<dyn LlmService>),
        };

        match service {
            Ok(service) => Some(Arc::new(LoggingService::new(service))),
            Err(_) => None,
        }
    }

    /// Register a service directly, keyed by its model ID. Used in tests.
    pub fn insert(&mut self, service: Arc<dyn LlmService>) {
        self.services.insert(service.model_id().to_string(), service);
    }

    /// Get a model by ID
    pub fn get(&self, model_id: &str) -> Option<Arc<dyn LlmService>> {
        self.services.get(model_id).cloned()
    }

    /// List all available model IDs
    pub fn available_models(&self) -> Vec<String> {
        let mut models: Vec<_> = self.services.keys().cloned().collect();
        models.sort();
        models
    }

    /// Check if any models are available
    pub fn has_models(&self) -> bool {
        !self.services.is_empty()
    }

    pub fn default_planner_model_id(&self) -> Option<&str> {
        self.default_planner.as_deref()
    }

    pub fn default_evaluator_model_id(&self) -> Option<&str> {
        self.default_evaluator.as_deref()
    }

    /// Mirror the registered models into the model catalog so that session
    /// validation and invocation agree on what is available.
    pub fn sync_catalog(&self, db: &Database) -> DbResult<()> {
        for model_def in all_models() {
            let registered = self.services.contains_key(model_def.id);
            let config = serde_json::json!({
                "provider": model_def.provider.display_name(),
                "api_name": model_def.api_name,
                "description": model_def.description,
            });
            db.upsert_model_config(model_def.id, model_def.role, Some(&config), registered)?;
        }
        Ok(())
    }
}

fn first_with_role(
    services: &HashMap<String, Arc<dyn LlmService>>,
    role: ModelRole,
) -> Option<String> {
    let mut candidates: Vec<&str> = all_models()
        .iter()
        .filter(|def| def.role == role && services.contains_key(def.id))
        .map(|def| def.id)
        .collect();
    candidates.sort_unstable();
    candidates.first().map(|id| (*id).to_string())
}
