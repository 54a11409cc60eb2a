use crate::batch::model::StepError;
use crate::executor::types::{AnalysisExecutor, StepOutput};
use crate::rotator::Credential;
use async_trait::async_trait;
use log::info;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;

const SYSTEM_PROMPT: &str = "You extract key financial figures for one company and one fiscal year \
from its annual filing. Answer with a single JSON object.";

pub(crate) fn build_llm_http_client() -> Result<reqwest::Client, StepError> {
    let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(180));

    if let Ok(raw) = std::env::var("LLM_PROXY") {
        let t = raw.trim();
        if !t.is_empty() {
            let url = if t.contains("://") {
                t.to_string()
            } else {
                format!("socks5h://{}", t)
            };
            let proxy =
                reqwest::Proxy::all(&url).map_err(|e| StepError::permanent(e.to_string()))?;
            builder = builder.proxy(proxy);
        }
    }

    builder
        .build()
        .map_err(|e| StepError::permanent(e.to_string()))
}

/// HTTP 状态码分型：429/5xx/鉴权失败可重试（换个凭证再来），其余 4xx 不可重试
pub fn classify_status(status: StatusCode, body: &str) -> Option<StepError> {
    if status.is_success() {
        return None;
    }
    let code = status.as_u16();
    Some(match code {
        429 => StepError::transient("rate limited (429)"),
        401 | 403 => StepError::transient(format!("credential rejected ({})", code)),
        408 => StepError::transient("upstream timeout (408)"),
        500..=599 => StepError::transient(format!("upstream error ({}): {}", code, body)),
        _ => StepError::permanent(format!("request rejected ({}): {}", code, body)),
    })
}

/// OpenAI 兼容的 chat/completions 抽取执行器，每次调用使用轮换得到的凭证
#[derive(Clone)]
pub struct LlmExtractionExecutor {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl LlmExtractionExecutor {
    pub fn new(base_url: String, model: String) -> Result<Self, StepError> {
        Ok(Self {
            client: build_llm_http_client()?,
            base_url,
            model,
            temperature: 0.0,
            max_tokens: 2048,
        })
    }

    pub fn from_env() -> Result<Self, StepError> {
        let base_url = std::env::var("LLM_BASE_URL")
            .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string());
        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| "openai/gpt-4o-mini".to_string());
        Self::new(base_url, model)
    }

    fn user_prompt(item_key: &str, step: &str) -> String {
        format!(
            "Ticker: {}\nFiscal year: {}\nReturn revenue, net_income, total_assets, total_liabilities, \
operating_cash_flow and the filing source.",
            item_key, step
        )
    }
}

#[async_trait]
impl AnalysisExecutor for LlmExtractionExecutor {
    async fn execute(
        &self,
        item_key: &str,
        step: &str,
        credential: &Credential,
    ) -> Result<StepOutput, StepError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": Self::user_prompt(item_key, step)}
            ],
            "response_format": {"type": "json_object"},
            "stream": false
        });

        let resp = self
            .client
            .post(url)
            .bearer_auth(credential.secret())
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| StepError::transient(format!("network error: {}", e)))?;

        let status = resp.status();
        let raw = resp
            .text()
            .await
            .map_err(|e| StepError::transient(format!("read body failed: {}", e)))?;

        if let Some(err) = classify_status(status, &raw) {
            return Err(err);
        }

        let v: Value = serde_json::from_str(&raw)
            .map_err(|e| StepError::permanent(format!("json parse failed: {e}, raw={raw}")))?;

        let content = v
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(StepError::transient("empty completion content"));
        }

        let artifact_id = v
            .get("id")
            .and_then(|x| x.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("{}-{}-{}", item_key, step, chrono::Utc::now().timestamp_millis()));

        info!("✓ 抽取完成 {} {} -> {}", item_key, step, artifact_id);
        Ok(StepOutput { artifact_id })
    }
}
