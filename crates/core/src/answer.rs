use crate::config::CompletionSettings;
use crate::error::ModelError;
use crate::models::{SearchRequest, SearchResult};
use crate::orchestrator::DocumentService;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

#[async_trait]
pub trait CompletionModel: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, ModelError>;
}

/// Ollama's non-streaming `/api/generate` endpoint.
pub struct OllamaCompletion {
    client: Client,
    url: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaCompletion {
    pub fn new(
        url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ModelError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            url: url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }

    pub fn from_settings(settings: &CompletionSettings) -> Result<Self, ModelError> {
        Self::new(
            settings.url.clone(),
            settings.model.clone(),
            Duration::from_secs(settings.timeout_secs),
        )
    }
}

#[async_trait]
impl CompletionModel for OllamaCompletion {
    async fn generate(&self, prompt: &str) -> Result<String, ModelError> {
        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&GenerateRequest {
                model: &self.model,
                prompt,
                stream: false,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            return Err(ModelError::Response {
                backend: "ollama".to_string(),
                details: format!("{status}: {details}"),
            });
        }

        let parsed: GenerateResponse = response.json().await?;
        Ok(parsed.response)
    }
}

/// `{query}` is filled before `{context}`.
pub fn build_prompt(template: &str, question: &str, results: &[SearchResult]) -> String {
    let context = results
        .iter()
        .map(|result| result.texts.as_str())
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR);
    template
        .replace("{query}", question)
        .replace("{context}", &context)
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub passages: Vec<SearchResult>,
}

pub async fn answer(
    service: &DocumentService,
    llm: &dyn CompletionModel,
    template: &str,
    question: &str,
    request: &SearchRequest,
) -> Result<Answer, ModelError> {
    let passages = service.search(question, request).await;
    if passages.is_empty() {
        info!("no passages retrieved; answering without context");
    }

    let prompt = build_prompt(template, question, &passages);
    debug!(passages = passages.len(), prompt_chars = prompt.len(), "prompt built");
    let answer = llm.generate(&prompt).await?;

    Ok(Answer {
        answer: answer.trim().to_string(),
        passages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::tests::MANUAL;
    use crate::orchestrator::tests::{service_with, test_settings};
    use crate::stores::MemoryStore;
    use mockito::Matcher;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;
    use uuid::Uuid;

    struct RecordingModel {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CompletionModel for RecordingModel {
        async fn generate(&self, prompt: &str) -> Result<String, ModelError> {
            if let Ok(mut prompts) = self.prompts.lock() {
                prompts.push(prompt.to_string());
            }
            Ok("  Every thirty days.\n".to_string())
        }
    }

    fn result(texts: &str) -> SearchResult {
        SearchResult {
            ids: vec![Uuid::new_v4()],
            chunks: vec![0],
            file_paths: BTreeSet::new(),
            file_types: BTreeSet::new(),
            texts: texts.to_string(),
            score: 0.9,
        }
    }

    #[test]
    fn prompt_joins_contexts_and_fills_question() {
        let prompt = build_prompt(
            "Q: {query}\nC: {context}",
            "How often?",
            &[result("first"), result("second")],
        );
        assert_eq!(prompt, "Q: How often?\nC: first\n\n---\n\nsecond");
    }

    #[test]
    fn query_is_filled_before_context() {
        let prompt = build_prompt("{query} | {context}", "what is {context}?", &[result("x")]);
        assert_eq!(prompt, "what is x? | x");
    }

    #[tokio::test]
    async fn ollama_completion_reads_response_field() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/generate")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "model": "llama3",
                "prompt": "hello",
                "stream": false
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"model":"llama3","response":"hi there","done":true}"#)
            .create_async()
            .await;

        let llm = OllamaCompletion::new(server.url(), "llama3", Duration::from_secs(5))
            .expect("client should build");
        let text = llm.generate("hello").await.expect("generation should succeed");

        assert_eq!(text, "hi there");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn ollama_completion_reports_server_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/generate")
            .with_status(500)
            .with_body("model not loaded")
            .create_async()
            .await;

        let llm = OllamaCompletion::new(server.url(), "llama3", Duration::from_secs(5))
            .expect("client should build");
        match llm.generate("hello").await {
            Err(ModelError::Response { details, .. }) => assert!(details.contains("model not loaded")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn answer_uses_retrieved_passages() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("manual.txt");
        std::fs::write(&path, MANUAL)?;
        let service = service_with(Arc::new(MemoryStore::new()), &test_settings());
        service.ensure_collection().await?;
        service.ingest(&path, None).await?;

        let llm = RecordingModel {
            prompts: Mutex::new(Vec::new()),
        };
        let request = SearchRequest {
            limit: 1,
            score_threshold: 0.0,
            filters: Default::default(),
        };
        let reply = answer(
            &service,
            &llm,
            "Context: {context}\nQuestion: {query}",
            "Filters are replaced every thirty days.",
            &request,
        )
        .await?;

        assert_eq!(reply.answer, "Every thirty days.");
        assert_eq!(reply.passages.len(), 1);
        let prompts = llm.prompts.lock().map_err(|error| error.to_string())?;
        assert!(prompts[0].starts_with("Context: "));
        assert!(prompts[0].contains(&reply.passages[0].texts));
        Ok(())
    }
}
