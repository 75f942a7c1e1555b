//! Model clients and prompt rendering.
//!
//! Pipelines talk to models through [`TextGenerator`] and [`ImageGenerator`];
//! the concrete clients build provider-specific requests and send them
//! through the shared [`ResilientCaller`].

pub mod gemini;
pub mod openai;

use std::collections::BTreeMap;
use std::env;
use std::sync::Arc;

use anyhow::Context;
use lib_batch::{ResilientCaller, TaskError};
use minijinja::Environment;

use crate::worker_config::ApiConfig;

pub use gemini::{GeminiClient, ImagenClient, VertexEndpoint};
pub use openai::OpenAiImageClient;

pub trait TextGenerator: Send + Sync {
    fn generate(&self, caller: &ResilientCaller, prompt: &str) -> Result<String, TaskError>;
}

pub trait ImageGenerator: Send + Sync {
    /// Returns the generated PNG, base64-encoded.
    fn generate_png(&self, caller: &ResilientCaller, prompt: &str) -> Result<String, TaskError>;
}

/// Fill `{{ name }}` placeholders from the configured prompt variables.
/// Unknown placeholders render empty.
pub fn render_base_prompt(template: &str, vars: &BTreeMap<String, String>) -> anyhow::Result<String> {
    Environment::new()
        .render_str(template, vars)
        .context("rendering base prompt")
}

fn required_env(name: &str) -> anyhow::Result<String> {
    env::var(name).with_context(|| format!("{name} is not set"))
}

pub fn text_generator_from_env(api: &ApiConfig) -> anyhow::Result<Arc<dyn TextGenerator>> {
    let endpoint = VertexEndpoint::new(&api.region, required_env("GEMINI_PROJECT_ID")?);
    Ok(Arc::new(GeminiClient::new(
        endpoint,
        &api.text_model,
        required_env("GEMINI_ACCESS_TOKEN")?,
    )))
}

pub fn image_generator_from_env(api: &ApiConfig) -> anyhow::Result<Arc<dyn ImageGenerator>> {
    if api.image_model.contains("imagen") {
        let endpoint = VertexEndpoint::new(&api.region, required_env("GEMINI_PROJECT_ID")?);
        Ok(Arc::new(ImagenClient::new(
            endpoint,
            &api.image_model,
            required_env("GEMINI_ACCESS_TOKEN")?,
        )))
    } else {
        Ok(Arc::new(OpenAiImageClient::new(
            &api.image_model,
            &api.image_size,
            required_env("OPENAI_API_KEY")?,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_base_prompt() {
        let vars = BTreeMap::from([("domain".to_string(), "品質".to_string())]);
        let rendered = render_base_prompt("Analyze {{ domain }} data. {{ missing }}!", &vars).unwrap();
        assert_eq!(rendered, "Analyze 品質 data. !");
    }

    #[test]
    fn test_plain_prompt_is_unchanged() {
        let rendered = render_base_prompt("no placeholders", &BTreeMap::new()).unwrap();
        assert_eq!(rendered, "no placeholders");
    }
}
