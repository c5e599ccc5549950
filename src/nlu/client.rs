use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::settings::{NluConfig, NluProvider};

/// The external NLU service: instructions plus transcript in, raw text out.
/// No retries; the caller bounds the call with a timeout.
#[async_trait]
pub trait NluService: Send + Sync {
    async fn complete(&self, instructions: &str, transcript: &str) -> Result<String>;
}

pub fn from_config(config: &NluConfig) -> Result<Box<dyn NluService>> {
    match config.provider {
        NluProvider::Anthropic => Ok(Box::new(AnthropicNlu::new(config)?)),
        NluProvider::Bedrock => Ok(Box::new(BedrockNlu::new(config))),
    }
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    text: Option<String>,
}

pub struct AnthropicNlu {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
}

impl AnthropicNlu {
    pub fn new(config: &NluConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .context("No Anthropic API key found. Either:\n  - Set ANTHROPIC_API_KEY in ~/.sitelog/env\n  - Set nlu.api_key in ~/.sitelog/config.toml\n  - Or switch to Bedrock: set nlu.provider = \"bedrock\" in config.toml")?;

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl NluService for AnthropicNlu {
    async fn complete(&self, instructions: &str, transcript: &str) -> Result<String> {
        let url = format!("{}/v1/messages", self.base_url);
        let request = AnthropicRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            system: instructions.to_string(),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: transcript.to_string(),
            }],
        };

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .context("Failed to call Anthropic API")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Anthropic API error ({}): {}", status, body);
        }

        let msg: AnthropicResponse = response
            .json()
            .await
            .context("Failed to parse Anthropic API response")?;

        Ok(msg
            .content
            .into_iter()
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join(""))
    }
}

pub struct BedrockNlu {
    model: String,
    region: String,
    max_tokens: u32,
}

impl BedrockNlu {
    pub fn new(config: &NluConfig) -> Self {
        Self {
            model: config.model.clone(),
            region: config
                .aws_region
                .clone()
                .unwrap_or_else(|| "us-east-1".to_string()),
            max_tokens: config.max_tokens,
        }
    }
}

#[async_trait]
impl NluService for BedrockNlu {
    async fn complete(&self, instructions: &str, transcript: &str) -> Result<String> {
        use aws_sdk_bedrockruntime::types::{
            ContentBlock, ConversationRole, InferenceConfiguration, Message, SystemContentBlock,
        };

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(self.region.clone()))
            .load()
            .await;
        let client = aws_sdk_bedrockruntime::Client::new(&sdk_config);

        let message = Message::builder()
            .role(ConversationRole::User)
            .content(ContentBlock::Text(transcript.to_string()))
            .build()
            .context("Failed to build Bedrock message")?;

        let response = client
            .converse()
            .model_id(&self.model)
            .system(SystemContentBlock::Text(instructions.to_string()))
            .inference_config(
                InferenceConfiguration::builder()
                    .max_tokens(i32::try_from(self.max_tokens).unwrap_or(i32::MAX))
                    .build(),
            )
            .messages(message)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Bedrock API error: {}", e))?;

        let output = response
            .output()
            .ok_or_else(|| anyhow::anyhow!("No output in Bedrock response"))?;
        let reply = output
            .as_message()
            .map_err(|_| anyhow::anyhow!("Bedrock output is not a message"))?;

        let text = reply
            .content()
            .iter()
            .filter_map(|block| block.as_text().ok().map(|s| s.as_str()))
            .collect::<Vec<_>>()
            .join("");

        if text.is_empty() {
            bail!("Empty response from Bedrock");
        }
        Ok(text)
    }
}
