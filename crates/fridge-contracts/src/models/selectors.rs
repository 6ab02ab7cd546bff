use super::registry::{ModelRegistry, ModelSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    /// Human-readable note when the selection differs from a plain
    /// registry hit.
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    /// Picks a model for `capability`.
    ///
    /// Registered models lacking the capability fall back to the default.
    /// Unregistered names pass through untouched so newer models work
    /// without a registry update.
    pub fn select(
        &self,
        requested: Option<&str>,
        capability: &str,
    ) -> Result<ModelSelection, String> {
        let requested = requested
            .map(str::trim)
            .map(|value| value.strip_prefix("models/").unwrap_or(value))
            .filter(|value| !value.is_empty());

        let note = match requested {
            Some(name) => match self.registry.get(name) {
                Some(model) if model.supports(capability) => {
                    return Ok(ModelSelection {
                        model: model.clone(),
                        requested: Some(name.to_string()),
                        note: None,
                    });
                }
                Some(_) => format!(
                    "Requested model '{name}' unavailable for capability '{capability}'."
                ),
                None => {
                    return Ok(ModelSelection {
                        model: ModelSpec {
                            name: name.to_string(),
                            capabilities: vec![capability.to_string()],
                            context_window: None,
                        },
                        requested: Some(name.to_string()),
                        note: Some(format!(
                            "Model '{name}' is not in the known model list; using it as given."
                        )),
                    });
                }
            },
            None => "No model specified; using default.".to_string(),
        };

        let candidates = self.registry.by_capability(capability);
        let Some(model) = candidates.first().cloned() else {
            return Err(format!(
                "No models available for capability '{capability}'."
            ));
        };
        Ok(ModelSelection {
            model,
            requested: requested.map(str::to_string),
            note: Some(note),
        })
    }
}
