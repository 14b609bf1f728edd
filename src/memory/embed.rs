//! Embedding seam for similar-decision retrieval. The live embedder
//! calls the OpenRouter embeddings endpoint; a deterministic hashing
//! embedder backs tests and offline runs. Embedding failures never
//! block the decision path; the caller stores the decision without a
//! vector.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// OpenRouter embeddings client (OpenAI-compatible payload).
#[derive(Clone)]
pub struct OpenRouterEmbedder {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenRouterEmbedder {
    pub fn from_env(http: reqwest::Client, model: &str) -> Result<Self> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .context("OPENROUTER_API_KEY missing (set env var)")?;
        if api_key.trim().is_empty() {
            return Err(anyhow!("OPENROUTER_API_KEY empty"));
        }
        Ok(Self {
            http,
            api_key,
            model: model.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

#[async_trait::async_trait]
impl Embedder for OpenRouterEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let req = EmbeddingRequest {
            model: self.model.clone(),
            input: text.chars().take(4000).collect(),
        };
        let resp = self
            .http
            .post("https://openrouter.ai/api/v1/embeddings")
            .timeout(Duration::from_secs(10))
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .json(&req)
            .send()
            .await
            .context("embeddings request")?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = body.chars().take(400).collect();
            return Err(anyhow!("embeddings {}: {}", status.as_u16(), snippet));
        }

        let parsed: EmbeddingResponse =
            serde_json::from_str(&body).context("embeddings json parse")?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|row| row.embedding)
            .ok_or_else(|| anyhow!("embeddings response empty"))
    }
}

/// Deterministic bag-of-tokens embedder: each token hashes into one of
/// `DIM` buckets. Not semantically deep, but stable and dependency-free
/// for tests and paper sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashEmbedder;

const DIM: usize = 64;

#[async_trait::async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; DIM];
        for token in text
            .split(|c: char| !c.is_alphanumeric() && c != '.')
            .filter(|t| !t.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            token.to_ascii_lowercase().hash(&mut hasher);
            let bucket = (hasher.finish() % DIM as u64) as usize;
            vector[bucket] += 1.0;
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_bounds() {
        let a = [1.0, 0.0, 1.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[0.0, 1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&a, &[1.0, 0.0]), 0.0); // length mismatch
    }

    #[tokio::test]
    async fn hash_embedder_is_stable_and_discriminative() {
        let embedder = HashEmbedder;
        let a = embedder.embed("sold XSP 560 put delta 0.068").await.unwrap();
        let b = embedder.embed("sold XSP 560 put delta 0.068").await.unwrap();
        let c = embedder.embed("vix spike halted new entries").await.unwrap();
        assert_eq!(a, b);
        let same = cosine_similarity(&a, &b);
        let diff = cosine_similarity(&a, &c);
        assert!(same > diff);
    }
}
