use crate::chunking::normalize_whitespace;
use crate::config::{EmbeddingBackend, EmbeddingSettings};
use crate::error::ModelError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error};

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 128;

#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    fn name(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// One vector per input, in input order.
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError>;
}

pub fn model_from_settings(
    settings: &EmbeddingSettings,
) -> Result<Arc<dyn EmbeddingModel>, ModelError> {
    Ok(match settings.backend {
        EmbeddingBackend::Ngram => Arc::new(CharacterNgramEmbedder {
            dimensions: settings.dimensions,
        }),
        EmbeddingBackend::Ollama => Arc::new(OllamaEmbedder::new(
            settings.url.clone(),
            settings.model.clone(),
            settings.dimensions,
            Duration::from_secs(settings.timeout_secs),
        )?),
    })
}

/// Hashed character trigram counts, L2-normalized. Needs no model server.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingModel for CharacterNgramEmbedder {
    fn name(&self) -> &str {
        "character-ngram"
    }

    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        Ok(texts.iter().map(|text| self.embed(text)).collect())
    }
}

/// Ollama's `/api/embed` endpoint.
pub struct OllamaEmbedder {
    client: Client,
    url: String,
    model: String,
    dimensions: usize,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    pub fn new(
        url: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
        timeout: Duration,
    ) -> Result<Self, ModelError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            url: url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            dimensions,
        })
    }
}

#[async_trait]
impl EmbeddingModel for OllamaEmbedder {
    fn name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&EmbedRequest {
                model: &self.model,
                input: texts,
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

        let parsed: EmbedResponse = response.json().await?;
        Ok(parsed.embeddings)
    }
}

/// Cache key of a normalized text.
pub fn content_hash(normalized: &str) -> String {
    let digest = Sha256::digest(normalized.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Batched, cached front of an [`EmbeddingModel`].
///
/// Inputs are whitespace-normalized, looked up by content hash, and the
/// distinct misses of a batch go to the model in one call. A failing model
/// yields zero vectors, which are never cached.
pub struct EmbeddingBatcher {
    model: Arc<dyn EmbeddingModel>,
    cache: Mutex<HashMap<String, Vec<f32>>>,
}

impl EmbeddingBatcher {
    pub fn new(model: Arc<dyn EmbeddingModel>) -> Self {
        Self {
            model,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.model.dimensions()
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn cached(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub async fn embed_one(&self, text: &str) -> Vec<f32> {
        self.embed_batch(&[text.to_string()])
            .await
            .into_iter()
            .next()
            .unwrap_or_else(|| vec![0.0; self.dimensions()])
    }

    /// One vector per input, in input order.
    pub async fn embed_batch(&self, texts: &[String]) -> Vec<Vec<f32>> {
        if texts.is_empty() {
            return Vec::new();
        }

        let dimensions = self.dimensions();
        let mut output: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut misses: Vec<(String, String)> = Vec::new();
        let mut slots: HashMap<String, Vec<usize>> = HashMap::new();

        {
            let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            for (position, text) in texts.iter().enumerate() {
                let normalized = normalize_whitespace(text);
                if normalized.is_empty() {
                    output[position] = Some(vec![0.0; dimensions]);
                    continue;
                }
                let key = content_hash(&normalized);
                if let Some(vector) = cache.get(&key) {
                    output[position] = Some(vector.clone());
                    continue;
                }
                match slots.entry(key) {
                    Entry::Occupied(mut entry) => entry.get_mut().push(position),
                    Entry::Vacant(entry) => {
                        misses.push((entry.key().clone(), normalized));
                        entry.insert(vec![position]);
                    }
                }
            }
        }

        debug!(
            inputs = texts.len(),
            misses = misses.len(),
            model = self.model.name(),
            "embedding batch"
        );

        if !misses.is_empty() {
            let inputs = misses
                .iter()
                .map(|(_, normalized)| normalized.clone())
                .collect::<Vec<_>>();

            match self.encode_checked(&inputs).await {
                Ok(vectors) => {
                    let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
                    for ((key, _), vector) in misses.into_iter().zip(vectors) {
                        for &position in slots.get(&key).into_iter().flatten() {
                            output[position] = Some(vector.clone());
                        }
                        cache.insert(key, vector);
                    }
                }
                Err(error) => {
                    error!(
                        %error,
                        inputs = inputs.len(),
                        model = self.model.name(),
                        "embedding failed; substituting zero vectors"
                    );
                }
            }
        }

        output
            .into_iter()
            .map(|vector| vector.unwrap_or_else(|| vec![0.0; dimensions]))
            .collect()
    }

    async fn encode_checked(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        let vectors = self.model.encode(inputs).await?;
        if vectors.len() != inputs.len() {
            return Err(ModelError::CountMismatch {
                expected: inputs.len(),
                actual: vectors.len(),
            });
        }
        let expected = self.dimensions();
        if let Some(vector) = vectors.iter().find(|vector| vector.len() != expected) {
            return Err(ModelError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Maps each text to `[len, 1.0]` and records every call.
    struct RecordingModel {
        calls: Mutex<Vec<Vec<String>>>,
        failing: AtomicBool,
    }

    impl RecordingModel {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failing: AtomicBool::new(false),
            }
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl EmbeddingModel for RecordingModel {
        fn name(&self) -> &str {
            "recording"
        }

        fn dimensions(&self) -> usize {
            2
        }

        async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
            self.calls.lock().expect("lock").push(texts.to_vec());
            if self.failing.load(Ordering::SeqCst) {
                return Err(ModelError::Response {
                    backend: "recording".to_string(),
                    details: "offline".to_string(),
                });
            }
            Ok(texts
                .iter()
                .map(|text| vec![text.len() as f32, 1.0])
                .collect())
        }
    }

    struct ShortModel;

    #[async_trait]
    impl EmbeddingModel for ShortModel {
        fn name(&self) -> &str {
            "short"
        }

        fn dimensions(&self) -> usize {
            3
        }

        async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
            Ok(texts.iter().map(|_| vec![1.0]).collect())
        }
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn ngram_embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed("Hydraulic pressure and flow");
        let second = embedder.embed("Hydraulic pressure and flow");
        assert_eq!(first, second);
    }

    #[test]
    fn ngram_embedder_outputs_expected_length() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        let vector = embedder.embed("abc");
        assert_eq!(vector.len(), 32);
    }

    #[tokio::test]
    async fn empty_batch_returns_nothing() {
        let model = Arc::new(RecordingModel::new());
        let batcher = EmbeddingBatcher::new(model.clone());
        assert!(batcher.embed_batch(&[]).await.is_empty());
        assert!(model.calls().is_empty());
    }

    #[tokio::test]
    async fn repeated_text_is_served_from_cache() {
        let model = Arc::new(RecordingModel::new());
        let batcher = EmbeddingBatcher::new(model.clone());

        let first = batcher.embed_one("pump  housing").await;
        let second = batcher.embed_one("pump housing").await;

        assert_eq!(first, second);
        assert_eq!(model.calls(), vec![strings(&["pump housing"])]);
        assert_eq!(batcher.cached(), 1);
    }

    #[tokio::test]
    async fn distinct_misses_share_one_call_and_keep_order() {
        let model = Arc::new(RecordingModel::new());
        let batcher = EmbeddingBatcher::new(model.clone());
        batcher.embed_one("cached").await;

        let vectors = batcher
            .embed_batch(&strings(&["abc", "cached", "  ", "abc", "abcdef"]))
            .await;

        assert_eq!(
            vectors,
            vec![
                vec![3.0, 1.0],
                vec![6.0, 1.0],
                vec![0.0, 0.0],
                vec![3.0, 1.0],
                vec![6.0, 1.0],
            ]
        );
        assert_eq!(
            model.calls(),
            vec![strings(&["cached"]), strings(&["abc", "abcdef"])]
        );
    }

    #[tokio::test]
    async fn model_failure_yields_uncached_zero_vectors() {
        let model = Arc::new(RecordingModel::new());
        model.failing.store(true, Ordering::SeqCst);
        let batcher = EmbeddingBatcher::new(model.clone());

        let vectors = batcher.embed_batch(&strings(&["valve", "seal"])).await;
        assert_eq!(vectors, vec![vec![0.0, 0.0], vec![0.0, 0.0]]);
        assert_eq!(batcher.cached(), 0);

        model.failing.store(false, Ordering::SeqCst);
        assert_eq!(batcher.embed_one("valve").await, vec![5.0, 1.0]);
        assert_eq!(model.calls().len(), 2);
    }

    #[tokio::test]
    async fn wrong_dimensions_are_rejected() {
        let batcher = EmbeddingBatcher::new(Arc::new(ShortModel));
        assert_eq!(batcher.embed_one("text").await, vec![0.0, 0.0, 0.0]);
        assert_eq!(batcher.cached(), 0);
    }

    #[tokio::test]
    async fn ollama_embedder_posts_inputs() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/embed")
            .match_body(Matcher::Json(json!({
                "model": "bge-m3",
                "input": ["first", "second"],
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"embeddings": [[0.5, 0.5], [1.0, 0.0]]}"#)
            .create_async()
            .await;

        let embedder = OllamaEmbedder::new(server.url(), "bge-m3", 2, Duration::from_secs(5))
            .expect("client should build");
        let vectors = embedder
            .encode(&strings(&["first", "second"]))
            .await
            .expect("encode should succeed");

        mock.assert_async().await;
        assert_eq!(vectors, vec![vec![0.5, 0.5], vec![1.0, 0.0]]);
    }

    #[test]
    fn content_hash_is_hex_sha256() {
        assert_eq!(
            content_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
