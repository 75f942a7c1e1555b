//! Vertex AI: Gemini `generateContent` and Imagen `predict`.

use anyhow::anyhow;
use lib_batch::{CallRequest, ResilientCaller, TaskError};
use lib_utils::text::preview;
use serde::Deserialize;
use serde_json::json;

use super::{ImageGenerator, TextGenerator};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexEndpoint {
    region: String,
    project_id: String,
}

impl VertexEndpoint {
    pub fn new(region: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            project_id: project_id.into(),
        }
    }

    fn host(&self) -> String {
        if self.region == "global" {
            "https://aiplatform.googleapis.com".to_string()
        } else {
            format!("https://{}-aiplatform.googleapis.com", self.region)
        }
    }

    pub fn model_url(&self, model: &str, method: &str) -> String {
        format!(
            "{}/v1/projects/{}/locations/{}/publishers/google/models/{}:{}",
            self.host(),
            self.project_id,
            self.region,
            model,
            method
        )
    }
}

// ====================
// Gemini
// ====================

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

pub struct GeminiClient {
    endpoint: VertexEndpoint,
    model: String,
    access_token: String,
}

impl GeminiClient {
    pub fn new(endpoint: VertexEndpoint, model: &str, access_token: String) -> Self {
        Self {
            endpoint,
            model: model.to_string(),
            access_token,
        }
    }

    fn request(&self, prompt: &str) -> Result<CallRequest, TaskError> {
        let body = json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": prompt }]
            }]
        });
        CallRequest::post(self.endpoint.model_url(&self.model, "generateContent"))
            .bearer_auth(&self.access_token)
            .json(&body)
            .map_err(|e| TaskError::Other(e.into()))
    }
}

/// First text part of the first candidate. A reply without one (safety
/// filter, empty output) is an error for the task.
fn first_text(raw: &str) -> Result<String, TaskError> {
    let parsed: GenerateContentResponse =
        serde_json::from_str(raw).map_err(|e| TaskError::Other(e.into()))?;
    parsed
        .candidates
        .into_iter()
        .filter_map(|c| c.content)
        .flat_map(|c| c.parts)
        .find_map(|p| p.text)
        .ok_or_else(|| TaskError::Other(anyhow!("model returned no text: {}", preview(raw, 300))))
}

impl TextGenerator for GeminiClient {
    fn generate(&self, caller: &ResilientCaller, prompt: &str) -> Result<String, TaskError> {
        let response = caller.call(&self.request(prompt)?)?;
        first_text(&response.body)
    }
}

// ====================
// Imagen
// ====================

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    bytes_base64_encoded: Option<String>,
}

pub struct ImagenClient {
    endpoint: VertexEndpoint,
    model: String,
    access_token: String,
}

impl ImagenClient {
    pub fn new(endpoint: VertexEndpoint, model: &str, access_token: String) -> Self {
        Self {
            endpoint,
            model: model.to_string(),
            access_token,
        }
    }
}

impl ImageGenerator for ImagenClient {
    fn generate_png(&self, caller: &ResilientCaller, prompt: &str) -> Result<String, TaskError> {
        let body = json!({
            "instances": [{ "prompt": prompt }],
            "parameters": {
                "sampleCount": 1,
                "aspectRatio": "16:9",
                "outputOptions": { "mimeType": "image/png" }
            }
        });
        let request = CallRequest::post(self.endpoint.model_url(&self.model, "predict"))
            .bearer_auth(&self.access_token)
            .json(&body)
            .map_err(|e| TaskError::Other(e.into()))?;

        let response = caller.call(&request)?;
        let parsed: PredictResponse = response.json().map_err(|e| TaskError::Other(e.into()))?;
        parsed
            .predictions
            .into_iter()
            .find_map(|p| p.bytes_base64_encoded)
            .ok_or_else(|| {
                TaskError::Other(anyhow!("Imagen returned no image: {}", preview(&response.body, 300)))
            })
    }
}
