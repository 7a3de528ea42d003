use crate::config::RagSettings;
use crate::error::ServiceError;
use crate::models::RetrievalCandidate;
use crate::safety::{apology_answer, DISCLAIMER};
use crate::traits::{ChatMessage, ChatModel, SamplingParams};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const SYSTEM_INSTRUCTION: &str = "You are a medical information assistant. \
Answer ONLY from the numbered context passages provided. \
Be factual, concise, and professional. \
Cite the passages you use as [n], where n is the passage number. \
If the context does not contain the answer, say explicitly that the provided context is insufficient.";

/// OpenAI-compatible `/chat/completions` endpoint.
pub struct RemoteChatModel {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: ChatMessage,
}

impl RemoteChatModel {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
            model: model.into(),
        })
    }
}

#[async_trait]
impl ChatModel for RemoteChatModel {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: SamplingParams,
    ) -> Result<String, ServiceError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&CompletionRequest {
                model: &self.model,
                messages,
                temperature: params.temperature,
                max_tokens: params.max_tokens,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::backend("chat", format!("{status}: {body}")));
        }

        let parsed: CompletionResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| ServiceError::backend("chat", "no response from model"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedAnswer {
    pub text: String,
    pub failed: bool,
}

/// True if `text` contains a `[n]` citation marker.
fn has_citation_marker(text: &str) -> bool {
    text.split('[').skip(1).any(|rest| {
        rest.split_once(']').is_some_and(|(inner, _)| {
            !inner.is_empty() && inner.chars().all(|ch| ch.is_ascii_digit())
        })
    })
}

pub fn build_context_block(contexts: &[RetrievalCandidate]) -> String {
    contexts
        .iter()
        .enumerate()
        .map(|(index, context)| format!("[{}] {}", index + 1, context.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Appends a sources stub when the model cited nothing, then the disclaimer if missing.
pub fn post_process(answer: &str, context_count: usize) -> String {
    let mut text = answer.trim_end().to_string();

    if context_count > 0 && !has_citation_marker(&text) {
        let sources = (1..=context_count)
            .map(|index| format!("[{index}]"))
            .collect::<Vec<_>>()
            .join(", ");
        text.push_str(&format!("\n\nSources: {sources}"));
    }

    if !text.contains(DISCLAIMER) {
        text.push_str(&format!("\n\n{DISCLAIMER}"));
    }

    text
}

pub struct Generator {
    model: Arc<dyn ChatModel>,
    params: SamplingParams,
}

impl Generator {
    pub fn new(model: Arc<dyn ChatModel>, settings: &RagSettings) -> Self {
        Self {
            model,
            params: SamplingParams {
                temperature: settings.temperature,
                max_tokens: settings.max_output_tokens,
            },
        }
    }

    pub fn messages(question: &str, contexts: &[RetrievalCandidate]) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(SYSTEM_INSTRUCTION),
            ChatMessage::user(format!(
                "Context:\n{}\n\nQuestion: {question}\n\nAnswer:",
                build_context_block(contexts)
            )),
        ]
    }

    /// Never fails: service errors become the apology answer.
    pub async fn answer(&self, question: &str, contexts: &[RetrievalCandidate]) -> GeneratedAnswer {
        let messages = Self::messages(question, contexts);

        match self.model.complete(&messages, self.params).await {
            Ok(raw) => {
                info!(contexts = contexts.len(), chars = raw.len(), "answer generated");
                GeneratedAnswer {
                    text: post_process(&raw, contexts.len()),
                    failed: false,
                }
            }
            Err(failure) => {
                error!(error = %failure, "generation failed");
                GeneratedAnswer {
                    text: apology_answer(),
                    failed: true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Metadata;
    use std::sync::Mutex;

    struct ScriptedModel {
        reply: Result<String, String>,
        seen: Mutex<Vec<(Vec<ChatMessage>, SamplingParams)>>,
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            params: SamplingParams,
        ) -> Result<String, ServiceError> {
            self.seen.lock().unwrap().push((messages.to_vec(), params));
            self.reply
                .clone()
                .map_err(|details| ServiceError::backend("chat", details))
        }
    }

    fn contexts() -> Vec<RetrievalCandidate> {
        ["ACE inhibitors can cause a dry cough.", "ARBs are an alternative."]
            .iter()
            .map(|text| RetrievalCandidate {
                text: text.to_string(),
                meta: Metadata::for_source("a.pdf"),
                score: 0.8,
            })
            .collect()
    }

    fn generator(reply: Result<String, String>) -> (Generator, Arc<ScriptedModel>) {
        let model = Arc::new(ScriptedModel {
            reply,
            seen: Mutex::new(Vec::new()),
        });
        (Generator::new(model.clone(), &RagSettings::default()), model)
    }

    #[test]
    fn context_block_is_numbered_and_paragraph_separated() {
        let block = build_context_block(&contexts());
        assert_eq!(
            block,
            "[1] ACE inhibitors can cause a dry cough.\n\n[2] ARBs are an alternative."
        );
    }

    #[test]
    fn citation_markers_need_digits() {
        assert!(has_citation_marker("see [12] and more"));
        assert!(!has_citation_marker("see [a] or [] or [1"));
    }

    #[test]
    fn post_processing_adds_sources_and_disclaimer_once() {
        let processed = post_process("Dry cough is common.", 2);
        assert!(processed.contains("Sources: [1], [2]"));
        assert!(processed.ends_with(DISCLAIMER));

        let cited = post_process(&format!("Dry cough [1].\n\n{DISCLAIMER}"), 2);
        assert!(!cited.contains("Sources:"));
        assert_eq!(cited.matches(DISCLAIMER).count(), 1);
    }

    #[tokio::test]
    async fn prompt_is_grounded_and_sampling_is_conservative() {
        let (generator, model) = generator(Ok("A dry cough [1].".to_string()));

        let answer = generator.answer("Why do I cough on lisinopril?", &contexts()).await;

        assert!(!answer.failed);
        assert!(answer.text.starts_with("A dry cough [1]."));
        let seen = model.seen.lock().unwrap();
        let (messages, params) = &seen[0];
        assert_eq!(messages[0].role, "system");
        assert!(messages[0].content.contains("ONLY"));
        assert!(messages[1].content.contains("[2] ARBs are an alternative."));
        assert!(messages[1].content.contains("Question: Why do I cough on lisinopril?"));
        assert!((params.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(params.max_tokens, 400);
    }

    #[tokio::test]
    async fn failures_become_an_apology() {
        let (generator, _model) = generator(Err("timeout".to_string()));

        let answer = generator.answer("question", &contexts()).await;

        assert!(answer.failed);
        assert_eq!(answer.text, apology_answer());
    }
}
