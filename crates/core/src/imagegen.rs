use anyhow::{Context, Result};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";
const GENERATE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Raw image bytes (base64) returned by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImagePayload {
    pub mime_type: String,
    pub data: String,
}

impl GeneratedImagePayload {
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

/// Turns a poster subject into the full prompt sent to the image model.
pub fn poster_prompt(subject: &str) -> String {
    format!(
        "Professional commercial photography of {subject} for T.T.A Distribution Tunis, high-end Italian style, 4k resolution."
    )
}

/// Anything that can render an image from a text prompt.
/// `Ok(None)` means the model answered without an image.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<Option<GeneratedImagePayload>>;
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidatePart {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

impl GenerateResponse {
    fn first_image(self) -> Option<GeneratedImagePayload> {
        self.candidates
            .into_iter()
            .next()?
            .content?
            .parts
            .into_iter()
            .find_map(|part| part.inline_data)
            .map(|inline| GeneratedImagePayload {
                mime_type: inline.mime_type,
                data: inline.data,
            })
    }
}

/// `generateContent` REST client for the Gemini image models.
pub struct GeminiImageClient {
    client: Client,
    api_key: SecretString,
    model: String,
}

impl GeminiImageClient {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model: model.into(),
        }
    }
}

#[async_trait]
impl ImageGenerator for GeminiImageClient {
    async fn generate(&self, prompt: &str) -> Result<Option<GeneratedImagePayload>> {
        let body = serde_json::json!({
            "contents": [
                { "parts": [ { "text": prompt } ] }
            ]
        });

        let url = format!("{GENERATE_BASE_URL}/{}:generateContent", self.model);
        let resp = self
            .client
            .post(url)
            .query(&[("key", self.api_key.expose_secret())])
            .json(&body)
            .send()
            .await
            .context("image generation request failed")?
            .error_for_status()
            .context("image generation rejected")?
            .json::<GenerateResponse>()
            .await
            .context("invalid image generation response")?;

        Ok(resp.first_image())
    }
}
