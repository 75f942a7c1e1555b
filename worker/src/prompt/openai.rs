use anyhow::anyhow;
use lib_batch::{CallRequest, ResilientCaller, TaskError};
use serde::Deserialize;
use serde_json::json;

use super::ImageGenerator;

const IMAGES_URL: &str = "https://api.openai.com/v1/images/generations";

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    b64_json: Option<String>,
}

pub struct OpenAiImageClient {
    model: String,
    size: String,
    api_key: String,
}

impl OpenAiImageClient {
    pub fn new(model: &str, size: &str, api_key: String) -> Self {
        Self {
            model: model.to_string(),
            size: size.to_string(),
            api_key,
        }
    }
}

impl ImageGenerator for OpenAiImageClient {
    fn generate_png(&self, caller: &ResilientCaller, prompt: &str) -> Result<String, TaskError> {
        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "n": 1,
            "size": self.size,
        });
        let request = CallRequest::post(IMAGES_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .map_err(|e| TaskError::Other(e.into()))?;

        let response: ImagesResponse = caller.call_json(&request)?;
        response
            .data
            .into_iter()
            .find_map(|d| d.b64_json)
            .ok_or_else(|| TaskError::Other(anyhow!("OpenAI returned no image")))
    }
}
