//! Classification gateway — free text in, `ClassificationResult` out.
//!
//! The drain loop talks to the gateway only through [`classify_bounded`],
//! which enforces the timeout and folds every failure into an `UNKNOWN`
//! result so that a broken classifier can never stall the queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ClassifyError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::intent::Intent;
use crate::pipeline::types::ClassificationResult;

/// Maximum characters of message body sent to the LLM.
const MAX_CONTENT_CHARS: usize = 4000;

/// Anything that can classify an inbound message.
#[async_trait]
pub trait ClassificationGateway: Send + Sync {
    async fn classify(
        &self,
        text: &str,
        subject: Option<&str>,
    ) -> Result<ClassificationResult, ClassifyError>;
}

/// Classify with a deadline. Never fails: errors and timeouts come back as
/// `UNKNOWN` with an empty reply and the reason in `failure`.
pub async fn classify_bounded(
    gateway: &dyn ClassificationGateway,
    text: &str,
    subject: Option<&str>,
    timeout: Duration,
) -> ClassificationResult {
    let err = match tokio::time::timeout(timeout, gateway.classify(text, subject)).await {
        Ok(Ok(result)) => return result,
        Ok(Err(e)) => e,
        Err(_) => ClassifyError::Timeout(timeout),
    };
    warn!(error = %err, "Classification failed, treating as UNKNOWN");
    ClassificationResult::failed(err.to_string())
}

/// Gateway backed by an LLM that answers with a JSON object.
pub struct LlmClassifier {
    llm: Arc<dyn LlmProvider>,
}

impl LlmClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl ClassificationGateway for LlmClassifier {
    async fn classify(
        &self,
        text: &str,
        subject: Option<&str>,
    ) -> Result<ClassificationResult, ClassifyError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_system_prompt()),
            ChatMessage::user(build_user_prompt(text, subject)),
        ])
        .with_temperature(0.0)
        .with_max_tokens(1024)
        .with_json_output();

        let response = self.llm.complete(request).await?;
        debug!(
            model = self.llm.model_name(),
            output_tokens = response.output_tokens,
            "Classifier responded"
        );
        parse_classification(&response.content).map_err(ClassifyError::Parse)
    }
}

fn build_system_prompt() -> String {
    "You are the reply classifier of a B2B sales team. A prospect answered our \
outreach message. Decide what they want and draft our answer.

Respond with a single JSON object:
{
  \"intent\": one of \"dnd\", \"demo_req\", \"present_req\", \"more_info_req\", \"timeout_req\", \"redirect_req\", \"unknown_req\",
  \"date\": date the prospect asked us to come back (YYYY-MM-DD), or null,
  \"contacts\": person or address the prospect redirected us to, or null,
  \"attachment\": file name of supporting material to send, or null,
  \"reply_text\": the answer to send back, in the prospect's language
}

Intents:
- dnd: asks us to stop writing, unsubscribe, not interested at all
- demo_req: wants a demo or trial access
- present_req: wants the presentation or deck
- more_info_req: asks questions about the product, prices, integrations
- timeout_req: interested but not now; asks to come back later
- redirect_req: says another person or department is responsible
- unknown_req: anything else, auto-replies, unclear messages

Only output the JSON object."
        .to_string()
}

fn build_user_prompt(text: &str, subject: Option<&str>) -> String {
    let mut prompt = String::new();
    if let Some(subject) = subject.filter(|s| !s.trim().is_empty()) {
        prompt.push_str(&format!("Subject: {subject}\n\n"));
    }
    prompt.push_str("Message:\n");
    if text.chars().count() > MAX_CONTENT_CHARS {
        let truncated: String = text.chars().take(MAX_CONTENT_CHARS).collect();
        prompt.push_str(&truncated);
        prompt.push_str("\n[...truncated]");
    } else {
        prompt.push_str(text);
    }
    prompt
}

#[derive(Debug, Deserialize)]
struct ClassifierResponse {
    #[serde(default, alias = "response_class", alias = "class")]
    intent: Option<Intent>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    contacts: Option<String>,
    #[serde(default, alias = "attachment_ref")]
    attachment: Option<String>,
    #[serde(default, alias = "model_response", alias = "response")]
    reply_text: Option<String>,
}

fn parse_classification(raw: &str) -> Result<ClassificationResult, String> {
    let json_str = extract_json_object(raw);
    let response: ClassifierResponse =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    Ok(ClassificationResult {
        intent: response.intent.unwrap_or(Intent::Unknown),
        date: non_empty(response.date),
        contacts: non_empty(response.contacts),
        attachment_ref: non_empty(response.attachment),
        reply_text: response.reply_text.unwrap_or_default().trim().to_string(),
        failure: None,
    })
}

/// LLMs like to spell "no value" in many ways.
fn non_empty(value: Option<String>) -> Option<String> {
    let v = value?.trim().to_string();
    match v.to_ascii_lowercase().as_str() {
        "" | "null" | "none" | "n/a" | "-" | "unknown" => None,
        _ => Some(v),
    }
}

/// Extract a JSON object from text that might be wrapped in markdown.
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::CompletionResponse;

    // ── Prompt construction ─────────────────────────────────────────

    #[test]
    fn system_prompt_lists_every_code() {
        let prompt = build_system_prompt();
        for code in [
            "dnd",
            "demo_req",
            "present_req",
            "more_info_req",
            "timeout_req",
            "redirect_req",
            "unknown_req",
        ] {
            assert!(prompt.contains(code), "missing {code}");
        }
    }

    #[test]
    fn user_prompt_includes_subject() {
        let prompt = build_user_prompt("Send me the deck", Some("Our offer"));
        assert!(prompt.starts_with("Subject: Our offer"));
        assert!(prompt.contains("Send me the deck"));
    }

    #[test]
    fn user_prompt_truncates_long_content() {
        let long = "x".repeat(MAX_CONTENT_CHARS + 100);
        let prompt = build_user_prompt(&long, None);
        assert!(prompt.contains("[...truncated]"));
        assert!(!prompt.contains("Subject:"));
    }

    // ── Response parsing ────────────────────────────────────────────

    #[test]
    fn parse_short_code_response() {
        let r = parse_classification(
            r#"{"intent":"timeout_req","date":"2024-10-01","contacts":null,"attachment":null,"reply_text":""}"#,
        )
        .unwrap();
        assert_eq!(r.intent, Intent::TimeoutRequest);
        assert_eq!(r.date.as_deref(), Some("2024-10-01"));
        assert!(r.contacts.is_none());
    }

    #[test]
    fn parse_original_field_names() {
        let r = parse_classification(
            r#"{"response_class":"redirect_req","date":"","contacts":"Ivan, ivan@corp.ru","need_more_info":"","need_image":"","model_response":"Thanks, we will write to Ivan."}"#,
        )
        .unwrap();
        assert_eq!(r.intent, Intent::RedirectRequest);
        assert_eq!(r.contacts.as_deref(), Some("Ivan, ivan@corp.ru"));
        assert_eq!(r.reply_text, "Thanks, we will write to Ivan.");
        assert!(r.date.is_none());
    }

    #[test]
    fn parse_unrecognized_intent_is_unknown() {
        let r = parse_classification(r#"{"intent":"escalate","reply_text":"hm"}"#).unwrap();
        assert_eq!(r.intent, Intent::Unknown);
    }

    #[test]
    fn parse_missing_fields_default() {
        let r = parse_classification("{}").unwrap();
        assert_eq!(r.intent, Intent::Unknown);
        assert!(r.reply_text.is_empty());
        assert!(!r.is_failure());
    }

    #[test]
    fn parse_response_wrapped_in_markdown() {
        let r = parse_classification("```json\n{\"intent\":\"DEMO_REQUEST\",\"reply_text\":\"Sure\"}\n```")
            .unwrap();
        assert_eq!(r.intent, Intent::DemoRequest);
        assert_eq!(r.reply_text, "Sure");
    }

    #[test]
    fn parse_garbage_fails() {
        assert!(parse_classification("I think this is a demo request").is_err());
    }

    #[test]
    fn extract_json_embedded_in_text() {
        let result = extract_json_object("Answer: {\"intent\": \"dnd\"} done.");
        assert_eq!(result, "{\"intent\": \"dnd\"}");
    }

    // ── Gateway behaviour ───────────────────────────────────────────

    struct MockLlm {
        response: Result<String, ()>,
    }

    #[async_trait]
    impl LlmProvider for MockLlm {
        fn model_name(&self) -> &str {
            "mock-classifier"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            assert!(request.json_output);
            match &self.response {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    input_tokens: 100,
                    output_tokens: 20,
                }),
                Err(()) => Err(LlmError::RequestFailed {
                    provider: "mock".into(),
                    reason: "connection refused".into(),
                }),
            }
        }
    }

    struct SlowGateway;

    #[async_trait]
    impl ClassificationGateway for SlowGateway {
        async fn classify(
            &self,
            _text: &str,
            _subject: Option<&str>,
        ) -> Result<ClassificationResult, ClassifyError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ClassificationResult::new(Intent::DemoRequest, "late"))
        }
    }

    #[tokio::test]
    async fn llm_classifier_parses_model_output() {
        let classifier = LlmClassifier::new(Arc::new(MockLlm {
            response: Ok(r#"{"intent":"present_req","reply_text":"Deck attached"}"#.into()),
        }));
        let r = classify_bounded(&classifier, "deck please", None, Duration::from_secs(5)).await;
        assert_eq!(r.intent, Intent::PresentationRequest);
        assert_eq!(r.reply_text, "Deck attached");
    }

    #[tokio::test]
    async fn llm_error_degrades_to_unknown() {
        let classifier = LlmClassifier::new(Arc::new(MockLlm { response: Err(()) }));
        let r = classify_bounded(&classifier, "hello", None, Duration::from_secs(5)).await;
        assert_eq!(r.intent, Intent::Unknown);
        assert!(r.reply_text.is_empty());
        assert!(r.failure.as_deref().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn unparsable_output_degrades_to_unknown() {
        let classifier = LlmClassifier::new(Arc::new(MockLlm {
            response: Ok("no idea".into()),
        }));
        let r = classify_bounded(&classifier, "hello", None, Duration::from_secs(5)).await;
        assert_eq!(r.intent, Intent::Unknown);
        assert!(r.is_failure());
    }

    #[tokio::test]
    async fn timeout_degrades_to_unknown() {
        let r = classify_bounded(&SlowGateway, "hello", None, Duration::from_millis(20)).await;
        assert_eq!(r.intent, Intent::Unknown);
        assert!(r.reply_text.is_empty());
        assert!(r.failure.as_deref().unwrap().contains("timed out"));
    }
}
