use crate::error::RagError;
use crate::models::RetrievedChunk;
use crate::traits::AnswerGenerator;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

pub const NO_CONTEXT_ANSWER: &str = "No relevant information was found in the indexed documents.";
const EXTRACT_CHARS: usize = 600;

/// Numbered context blocks, best hit first.
pub fn build_context(results: &[RetrievedChunk]) -> String {
    results
        .iter()
        .enumerate()
        .map(|(position, hit)| {
            format!(
                "[Source {}] (from {}, similarity: {:.3})\n{}\n",
                position + 1,
                hit.chunk.filename,
                hit.similarity,
                hit.chunk.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build_prompt(question: &str, context: &str) -> String {
    format!(
        "You are a helpful assistant answering questions based on provided documents.\n\n\
         Context from documents:\n{context}\n\
         Question: {question}\n\n\
         Instructions:\n\
         1. Answer using ONLY information from the provided context.\n\
         2. If the context does not contain enough information, say so clearly.\n\
         3. Cite the sources you used (e.g. \"According to Source 1...\").\n\
         4. Be concise but complete.\n\
         5. If sources contradict each other, mention it.\n\n\
         Answer:"
    )
}

#[derive(Debug, Clone, Serialize)]
struct AnswerRequest<'a> {
    question: &'a str,
    context: &'a str,
    prompt: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AnswerPayload {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

fn answer_from_payload(payload: AnswerPayload) -> Result<String, RagError> {
    payload
        .answer
        .or(payload.text)
        .map(|answer| answer.trim().to_string())
        .filter(|answer| !answer.is_empty())
        .ok_or_else(|| RagError::Answer("generation endpoint returned no answer".to_string()))
}

/// Posts `{question, context, prompt}` as JSON and reads `answer` (or `text`).
#[derive(Debug, Clone)]
pub struct HttpAnswerGenerator {
    endpoint: Url,
    api_key: Option<String>,
    client: Client,
}

impl HttpAnswerGenerator {
    pub fn new(endpoint: &str, api_key: Option<String>) -> Result<Self, RagError> {
        Ok(Self {
            endpoint: Url::parse(endpoint.trim())?,
            api_key: api_key
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty()),
            client: Client::new(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl AnswerGenerator for HttpAnswerGenerator {
    async fn generate_answer(&self, question: &str, context: &str) -> Result<String, RagError> {
        let payload = AnswerRequest {
            question,
            context,
            prompt: build_prompt(question, context),
        };

        let mut request = self.client.post(self.endpoint.clone()).json(&payload);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RagError::Answer(format!(
                "request to {} returned {}",
                self.endpoint,
                response.status()
            )));
        }

        answer_from_payload(response.json().await?)
    }
}

/// Offline generator: quotes the best passage instead of calling a model.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtractiveAnswerGenerator;

#[async_trait]
impl AnswerGenerator for ExtractiveAnswerGenerator {
    async fn generate_answer(&self, question: &str, context: &str) -> Result<String, RagError> {
        let mut blocks = context.split("\n\n[Source ");
        let Some(best) = blocks.next().filter(|block| !block.trim().is_empty()) else {
            return Ok(NO_CONTEXT_ANSWER.to_string());
        };
        let others = blocks.count();

        let mut lines = best.lines();
        let header = lines.next().unwrap_or_default();
        let body = lines.collect::<Vec<_>>().join("\n");
        let excerpt: String = body.trim().chars().take(EXTRACT_CHARS).collect();

        Ok(format!(
            "Most relevant passage for \"{}\" {}:\n\n{}\n\n({} further source(s) retrieved.)",
            question.trim(),
            header.trim(),
            excerpt,
            others
        ))
    }
}
