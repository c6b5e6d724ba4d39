//! Agent invoker backed by an OpenAI-compatible chat completions endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use workflow::{
    AgentInvoker, AgentRequest, InvokerError, ProgressReporter, persona::AgentPersona,
};

use super::config::LlmConfig;

const MAX_ATTEMPTS: u32 = 3;

pub struct LlmAgentInvoker {
    client: Client,
    config: LlmConfig,
    retry_delay: Duration,
}

impl LlmAgentInvoker {
    pub fn new(config: LlmConfig) -> Self {
        if config.api_key.is_some() {
            tracing::info!("[LLM_API] Agent invoker using {} with API key", config.model);
        } else {
            tracing::info!(
                "[LLM_API] Agent invoker using {} at {} without API key",
                config.model,
                config.endpoint
            );
        }
        Self {
            client: Client::new(),
            config,
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Base delay of the exponential backoff on 429 and 5xx responses.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    async fn complete(&self, payload: &Value) -> Result<Value, InvokerError> {
        let mut last_error = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = self.retry_delay * (1 << (attempt - 1));
                tracing::info!(
                    "[LLM_API] Retrying in {:?} (attempt {}/{})",
                    delay,
                    attempt + 1,
                    MAX_ATTEMPTS
                );
                tokio::time::sleep(delay).await;
            }

            let mut request = self
                .client
                .post(&self.config.endpoint)
                .header("Content-Type", "application/json");
            if let Some(key) = &self.config.api_key {
                request = request.bearer_auth(key);
            }

            let response = match request.json(payload).send().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!("[LLM_API] Request failed: {}", e);
                    last_error = Some(InvokerError::Transport(e.to_string()));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return response
                    .json::<Value>()
                    .await
                    .map_err(|e| InvokerError::MalformedResponse(e.to_string()));
            }

            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                tracing::warn!("[LLM_API] Retryable error ({}): {}", status, snippet);
                last_error = Some(InvokerError::Transport(format!("{status}: {snippet}")));
                continue;
            }

            tracing::error!("[LLM_API] API error ({}): {}", status, snippet);
            return Err(InvokerError::Rejected(format!("{status}: {snippet}")));
        }

        Err(last_error.unwrap_or_else(|| InvokerError::Transport("max retries exceeded".into())))
    }
}

/// User message sent for one step: the task, the original request, the
/// market context and whatever earlier agents concluded.
pub fn build_prompt(request: &AgentRequest) -> String {
    let mut prompt = format!(
        "Task: {}\n\nOriginal request: {}\n",
        request.task, request.message
    );

    let context = &request.context;
    if !context.symbols.is_empty() {
        prompt.push_str(&format!("Symbols: {}\n", context.symbols.join(", ")));
    }
    if let Some(timeframe) = &context.timeframe {
        prompt.push_str(&format!("Timeframe: {timeframe}\n"));
    }
    if let Some(risk) = &context.risk_tolerance {
        prompt.push_str(&format!("Risk tolerance: {risk}\n"));
    }

    if !request.previous_results.is_empty() {
        prompt.push_str("\nFindings from earlier agents:\n");
        for prior in &request.previous_results {
            let text = prior
                .result
                .get("response")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| prior.result.to_string());
            prompt.push_str(&format!(
                "\n## {}\n{}\n",
                prior.agent.profile().report_heading,
                text
            ));
        }
    }
    prompt
}

pub fn build_payload(config: &LlmConfig, request: &AgentRequest) -> Value {
    json!({
        "model": config.model,
        "messages": [
            { "role": "system", "content": request.agent.profile().system_prompt },
            { "role": "user", "content": build_prompt(request) },
        ],
        "temperature": config.temperature,
        "max_tokens": config.max_tokens,
        "stream": false,
    })
}

/// Text of the first choice of a chat completion.
pub fn parse_completion(body: &Value) -> Result<String, InvokerError> {
    let content = body["choices"][0]["message"]["content"]
        .as_str()
        .map(str::trim)
        .ok_or_else(|| InvokerError::MalformedResponse("missing choices[0].message.content".into()))?;
    if content.is_empty() {
        return Err(InvokerError::MalformedResponse("empty completion".into()));
    }
    Ok(content.to_string())
}

fn step_result(agent: AgentPersona, response: String) -> Value {
    json!({
        "agent": agent,
        "agentName": agent.display_name(),
        "heading": agent.profile().report_heading,
        "response": response,
    })
}

#[async_trait]
impl AgentInvoker for LlmAgentInvoker {
    async fn invoke(
        &self,
        request: AgentRequest,
        progress: ProgressReporter,
    ) -> Result<Value, InvokerError> {
        if self.config.endpoint.trim().is_empty() {
            return Err(InvokerError::NotConfigured("llm.endpoint is empty".into()));
        }

        progress.report(format!("{} is thinking", request.agent.display_name()), Some(10));
        let payload = build_payload(&self.config, &request);
        let body = self.complete(&payload).await?;
        let response = parse_completion(&body)?;
        progress.report(format!("{} finished", request.agent.display_name()), Some(100));

        tracing::debug!(
            "[LLM_API] Step {} of {} answered with {} chars",
            request.step_index,
            request.workflow_id,
            response.len()
        );
        Ok(step_result(request.agent, response))
    }
}
