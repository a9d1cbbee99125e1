//! # Tool Runtime
//!
//! Drives a language model through the two tool contracts of the extraction
//! protocol. The model decides when to call them; every call is routed to the
//! request's [`ExtractionCoordinator`], which alone decides what is accepted.
//!
//! ## Contracts exposed to the model:
//! - **get_transcription()**: transcript of the request's audio
//! - **extract_info(transcript, json_object)**: the single structured commit
//!
//! ## Loop:
//! Ask for a completion, execute the returned tool calls, append their results
//! as `tool` messages and repeat until the coordinator is terminal, the model
//! stops calling tools, or `agent.max_turns` is reached.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::audio::ConditionedSignal;
use crate::config::AgentConfig;
use crate::error::{AppError, AppResult};
use crate::triage::coordinator::{CommitRequest, CommitResult, ExtractionCoordinator, TranscribeRequest};

const SYSTEM_PROMPT: &str = "You are an AI assistant that will use tools supporting a triage system. \
Always use the tool get_transcription() when audio needs to be transcribed. \
Always use extract_info(transcript: str, json_object: str) to set the transcription and JSON object variables. \
Follow all rules carefully.";

const USER_PROMPT: &str = r#"Using available tools, get a transcription for this audio and **only** set the transcript and a JSON object with the following fields:

event: The type of event (shooting, stabbing, assault, domestic violence, sexual assault, robbery, medical emergency, fire, traffic accident, natural disaster, hazard, animal incident, missing person, public disturbance) --> If there isn't a clear category choose the closest match without inventing details.
victims: Number of victims (integer) --> If not explicitly stated, return 1
injuries: Type of injury (unresponsive, critical bleeding, severe burns, broken bones, minor bleeding, minor injury), else "none"
weapon: Type of weapon involved (firearm, explosive, hazardous_material, blade, blunt object, chemical, unknown), else "none"
ongoing_threat: Small description if event described is currently in progress or people are at risk, else "not ongoing" --> Always give the description if the transcription is describing a threat that is happening right now, even if they mention help is on the way.

Tools Available:
1. get_transcription() --> Transcribes this audio file and returns text
2. extract_info(transcript: str, json_object: str) --> Sets the transcription and the generated JSON object

Rules:
1. Do not output anything. The only output should be through the tool extract_info().
2. Do not add ANY extra text outside the JSON object.
3. If information for a field exists but it is not clear specific type (ex. there exists a weapon but don't know specific one) set to unknown. If nothing at all then use none as appropriate.
4. Limit text fields only to specified options for that respective field. Pick the single most severe injury.

Example of a generated JSON output:

{
  "event": "shooting",
  "victims": 1,
  "injuries": "unresponsive",
  "weapon": "firearm",
  "ongoing_threat": "shooter fled, not on scene"
}"#;

const GET_TRANSCRIPTION: &str = "get_transcription";
const EXTRACT_INFO: &str = "extract_info";

/// Something that drives the coordinator's protocol to a terminal state.
#[async_trait]
pub trait ToolRuntime: Send + Sync {
    async fn run(&self, audio: Arc<ConditionedSignal>, coordinator: &mut ExtractionCoordinator) -> AppResult<()>;

    fn name(&self) -> String;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

impl ChatMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    fn tool_result(call: &ToolCall, content: String) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content),
            tool_calls: None,
            tool_call_id: Some(call.id.clone()),
            name: Some(call.function.name.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    kind: String,
    function: FunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    /// JSON-encoded argument object
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    tools: &'a Value,
    tool_choice: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

fn tool_definitions() -> Value {
    json!([
        {
            "type": "function",
            "function": {
                "name": GET_TRANSCRIPTION,
                "description": "Transcribe the caller's audio and return the text",
                "parameters": { "type": "object", "properties": {}, "required": [] }
            }
        },
        {
            "type": "function",
            "function": {
                "name": EXTRACT_INFO,
                "description": "Set the transcript and the generated triage JSON object",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "transcript": { "type": "string", "description": "Full transcript of the call" },
                        "json_object": { "type": "string", "description": "Triage JSON object with event, victims, injuries, weapon and ongoing_threat" }
                    },
                    "required": ["transcript", "json_object"]
                }
            }
        }
    ])
}

/// OpenAI/Mistral-compatible chat completions with function tools.
pub struct ChatToolRuntime {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    max_turns: usize,
    tools: Value,
}

impl ChatToolRuntime {
    pub fn new(config: &AgentConfig, model: &str) -> AppResult<Self> {
        let api_base = config.api_base.trim_end_matches('/').to_string();
        reqwest::Url::parse(&api_base)
            .map_err(|e| AppError::Configuration(format!("Invalid agent api_base '{}': {}", api_base, e)))?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        if config.api_key.is_empty() {
            tracing::warn!("No agent API key configured; chat completion requests will be unauthenticated");
        }

        Ok(Self {
            client,
            api_base,
            api_key: config.api_key.clone(),
            model: model.to_string(),
            max_turns: config.max_turns,
            tools: tool_definitions(),
        })
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if !self.api_key.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", self.api_key)) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    async fn complete(&self, messages: &[ChatMessage]) -> AppResult<ChatMessage> {
        let url = format!("{}/chat/completions", self.api_base);
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            tools: &self.tools,
            tool_choice: "auto",
        };

        let response = self
            .client
            .post(&url)
            .headers(self.headers())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::ExternalService(format!("Language model request timed out: {}", e))
                } else {
                    AppError::ExternalService(format!("Failed to reach language model at {}: {}", self.api_base, e))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::ExternalService(format!(
                "Language model returned {}: {}",
                status, body
            )));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| AppError::ExternalService(format!("Failed to parse language model response: {}", e)))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| AppError::ExternalService("Language model returned no choices".to_string()))
    }
}

#[async_trait]
impl ToolRuntime for ChatToolRuntime {
    async fn run(&self, audio: Arc<ConditionedSignal>, coordinator: &mut ExtractionCoordinator) -> AppResult<()> {
        let mut messages = vec![
            ChatMessage::text("system", SYSTEM_PROMPT),
            ChatMessage::text("user", USER_PROMPT),
        ];

        for turn in 0..self.max_turns {
            let reply = self.complete(&messages).await?;
            let calls = reply.tool_calls.clone().unwrap_or_default();
            tracing::debug!("Agent turn {}: {} tool call(s)", turn + 1, calls.len());
            messages.push(reply);

            if calls.is_empty() {
                break;
            }
            for call in &calls {
                let content = dispatch(call, &audio, coordinator).await;
                messages.push(ChatMessage::tool_result(call, content));
            }
            if coordinator.is_terminal() {
                break;
            }
        }
        Ok(())
    }

    fn name(&self) -> String {
        format!("chat-tools:{}", self.model)
    }
}

#[derive(Debug, Deserialize)]
struct ExtractInfoArgs {
    #[serde(default)]
    transcript: String,
    json_object: Value,
}

/// Execute one tool call against the coordinator and render its result for the model.
async fn dispatch(call: &ToolCall, audio: &Arc<ConditionedSignal>, coordinator: &mut ExtractionCoordinator) -> String {
    match call.function.name.as_str() {
        GET_TRANSCRIPTION => {
            let request = TranscribeRequest {
                audio: Arc::clone(audio),
            };
            match coordinator.transcribe(request).await {
                Ok(result) => result.transcript,
                Err(err) => format!("Transcription failed: {}", err),
            }
        }
        EXTRACT_INFO => {
            let args: ExtractInfoArgs = match serde_json::from_str(&call.function.arguments) {
                Ok(args) => args,
                Err(e) => {
                    let err = AppError::Extraction(format!("Malformed extract_info arguments: {}", e));
                    let message = err.to_string();
                    coordinator.fail(err);
                    return message;
                }
            };
            // Some models send the object itself rather than its JSON text
            let json_object = match args.json_object {
                Value::String(text) => text,
                other => other.to_string(),
            };
            match coordinator.commit(CommitRequest {
                transcript: args.transcript,
                json_object,
            }) {
                CommitResult::Accepted(_) => "Triage record saved.".to_string(),
                CommitResult::Rejected(reason) => format!("Rejected: {}", reason),
            }
        }
        other => format!("Unknown tool '{}'", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triage::coordinator::tests::{FixedTranscriber, SHOOTING_JSON};
    use crate::triage::fields::Event;
    use uuid::Uuid;

    fn audio() -> Arc<ConditionedSignal> {
        Arc::new(ConditionedSignal {
            samples: vec![0.0; 16],
            sample_rate: 16000,
        })
    }

    fn call(name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            id: "call_1".to_string(),
            kind: function_type(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_dispatch_protocol() {
        let mut coordinator = ExtractionCoordinator::new(Uuid::new_v4(), FixedTranscriber::ok("shots fired"));

        let text = dispatch(&call(GET_TRANSCRIPTION, json!({})), &audio(), &mut coordinator).await;
        assert_eq!(text, "shots fired");

        let args = json!({ "transcript": "shots fired", "json_object": SHOOTING_JSON });
        let reply = dispatch(&call(EXTRACT_INFO, args), &audio(), &mut coordinator).await;
        assert_eq!(reply, "Triage record saved.");
        assert_eq!(coordinator.finish().unwrap().fields.event, Event::Shooting);
    }

    #[tokio::test]
    async fn test_dispatch_accepts_object_argument() {
        let mut coordinator = ExtractionCoordinator::new(Uuid::new_v4(), FixedTranscriber::ok("fire"));
        dispatch(&call(GET_TRANSCRIPTION, json!({})), &audio(), &mut coordinator).await;

        let object: Value = serde_json::from_str(SHOOTING_JSON).unwrap();
        let args = json!({ "transcript": "", "json_object": object });
        dispatch(&call(EXTRACT_INFO, args), &audio(), &mut coordinator).await;

        let extraction = coordinator.finish().unwrap();
        assert_eq!(extraction.transcript, "fire");
        assert_eq!(extraction.fields.victims, 1);
    }

    #[tokio::test]
    async fn test_dispatch_malformed_arguments_fail() {
        let mut coordinator = ExtractionCoordinator::new(Uuid::new_v4(), FixedTranscriber::ok("x"));
        dispatch(&call(GET_TRANSCRIPTION, json!({})), &audio(), &mut coordinator).await;

        let mut bad = call(EXTRACT_INFO, json!({}));
        bad.function.arguments = "{not json".to_string();
        dispatch(&bad, &audio(), &mut coordinator).await;
        assert!(matches!(coordinator.finish(), Err(AppError::Extraction(_))));
    }

    #[tokio::test]
    async fn test_unknown_tool_leaves_state() {
        let mut coordinator = ExtractionCoordinator::new(Uuid::new_v4(), FixedTranscriber::ok("x"));
        let reply = dispatch(&call("search_web", json!({})), &audio(), &mut coordinator).await;
        assert!(reply.contains("Unknown tool"));
        assert_eq!(coordinator.state().name(), "idle");
    }

    #[test]
    fn test_response_with_tool_calls_deserializes() {
        let body = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "abc",
                        "type": "function",
                        "function": { "name": "get_transcription", "arguments": "{}" }
                    }]
                }
            }]
        });
        let response: ChatCompletionResponse = serde_json::from_value(body).unwrap();
        let message = &response.choices[0].message;
        let calls = message.tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, GET_TRANSCRIPTION);
    }

    #[test]
    fn test_runtime_rejects_bad_base_url() {
        let config = AgentConfig {
            api_base: "not a url".to_string(),
            api_key: String::new(),
            max_turns: 3,
            timeout_secs: 5,
        };
        assert!(matches!(
            ChatToolRuntime::new(&config, "mistral-small-latest"),
            Err(AppError::Configuration(_))
        ));
    }

    #[test]
    fn test_prompt_example_uses_vocabulary() {
        let start = USER_PROMPT.rfind('{').unwrap();
        let example = &USER_PROMPT[start..];
        assert!(crate::triage::fields::TriageFields::from_json(example).is_ok());
    }
}
