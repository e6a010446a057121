//! Prompt templates for Svar.
//!
//! The built-in prompts can be overridden with a TOML file referenced from
//! the `[prompts]` section of the configuration.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Collection of all prompt templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Prompts {
    pub answer: AnswerPrompts,
    /// Custom variables from config, available in all prompts.
    #[serde(skip)]
    pub variables: HashMap<String, String>,
}

/// Prompts for answering a question over a transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnswerPrompts {
    pub system: String,
    pub user: String,
}

impl Default for AnswerPrompts {
    fn default() -> Self {
        Self {
            system: "You are a helpful assistant. You are given a context and a question. \
                     You must answer the question based on the context. If the context is \
                     not relevant to the question, you must say so. If the context is \
                     relevant to the question, you must answer the question based on the \
                     context."
                .to_string(),

            user: "The context: {{context}}\n\nThe question: {{question}}".to_string(),
        }
    }
}

impl Prompts {
    /// Load prompts: built-in defaults, optionally overridden by a custom
    /// TOML file, with config variables attached for rendering.
    pub fn load(
        custom_file: Option<&str>,
        variables: Option<&HashMap<String, String>>,
    ) -> Result<Self> {
        let mut prompts = match custom_file {
            Some(path) => {
                let expanded = shellexpand::tilde(path).to_string();
                if std::path::Path::new(&expanded).exists() {
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str(&content)?
                } else {
                    Prompts::default()
                }
            }
            None => Prompts::default(),
        };

        if let Some(vars) = variables {
            prompts.variables = vars.clone();
        }

        Ok(prompts)
    }

    /// Render a template, substituting {{name}} placeholders from the
    /// config variables plus the provided per-call values.
    pub fn render(&self, template: &str, vars: &HashMap<String, String>) -> String {
        let mut result = template.to_string();

        for (key, value) in self.variables.iter().chain(vars.iter()) {
            result = result.replace(&format!("{{{{{}}}}}", key), value);
        }

        result
    }
}
