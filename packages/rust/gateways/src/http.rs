//! JSON-over-HTTP collaborator clients.
//!
//! Wire contract (all `POST`, JSON bodies, optional bearer auth):
//!
//! | collaborator | request | response |
//! |--------------|---------|----------|
//! | search | `{query, top_k, user_context}` | `{candidates: [..]}` |
//! | generation | `{query, context, temperature}` | `{text}` |
//! | evaluation | `{query, chunks, answer}` | `{metrics: {name: score}}` |
//! | fact check | `{text}` | `{accuracy, factuality}` |

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use ragpipe_quality::{FactChecker, FactScores};
use ragpipe_shared::{CallContext, DocumentCandidate, RagError, Result, UserContext};

use crate::traits::{Evaluator, SearchBackend, TextGenerator};

const USER_AGENT: &str = concat!("ragpipe/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// One HTTP endpoint plus credentials.
#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    name: &'static str,
    client: Client,
    url: Url,
    api_key: Option<String>,
}

impl HttpEndpoint {
    pub fn new(name: &'static str, url: Url, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| RagError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            name,
            client,
            url,
            api_key,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn post<Req, Resp>(&self, body: &Req, call: &CallContext) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let mut request = self
            .client
            .post(self.url.clone())
            .timeout(call.timeout)
            .json(body);
        if let Some(token) = &self.api_key {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| self.transport_error(e, call))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.status_error(status));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(e, call))?;
        debug!(collaborator = self.name, bytes = bytes.len(), "response received");

        serde_json::from_slice(&bytes).map_err(|e| {
            RagError::Serialization(format!("{}: invalid response body: {e}", self.name))
        })
    }

    fn transport_error(&self, e: reqwest::Error, call: &CallContext) -> RagError {
        if e.is_timeout() {
            RagError::CollaboratorTimeout {
                collaborator: self.name.to_string(),
                timeout_ms: call.timeout.as_millis() as u64,
            }
        } else {
            RagError::unavailable(self.name, format!("{}: {e}", self.url))
        }
    }

    fn status_error(&self, status: StatusCode) -> RagError {
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            RagError::unavailable(self.name, format!("HTTP {status}"))
        } else {
            RagError::validation(format!("{} rejected the request: HTTP {status}", self.name))
        }
    }
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    top_k: usize,
    user_context: &'a UserContext,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    candidates: Vec<DocumentCandidate>,
}

pub struct HttpSearchBackend {
    endpoint: HttpEndpoint,
}

impl HttpSearchBackend {
    pub fn new(url: Url, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            endpoint: HttpEndpoint::new("search", url, api_key)?,
        })
    }
}

#[async_trait]
impl SearchBackend for HttpSearchBackend {
    async fn search(
        &self,
        query: &str,
        top_k: usize,
        user: &UserContext,
        call: &CallContext,
    ) -> Result<Vec<DocumentCandidate>> {
        let body = SearchRequest {
            query,
            top_k,
            user_context: user,
        };
        let response: SearchResponse = self.endpoint.post(&body, call).await?;
        Ok(response.candidates)
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct GenerateRequest<'a> {
    query: &'a str,
    context: &'a str,
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    text: String,
}

pub struct HttpGenerator {
    endpoint: HttpEndpoint,
}

impl HttpGenerator {
    pub fn new(url: Url, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            endpoint: HttpEndpoint::new("generation", url, api_key)?,
        })
    }
}

#[async_trait]
impl TextGenerator for HttpGenerator {
    async fn generate(
        &self,
        query: &str,
        context: &str,
        temperature: f32,
        call: &CallContext,
    ) -> Result<String> {
        let body = GenerateRequest {
            query,
            context,
            temperature,
        };
        let response: GenerateResponse = self.endpoint.post(&body, call).await?;
        Ok(response.text)
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct EvaluateRequest<'a> {
    query: &'a str,
    chunks: &'a [String],
    answer: &'a str,
}

#[derive(Deserialize)]
struct EvaluateResponse {
    #[serde(default)]
    metrics: BTreeMap<String, f64>,
}

pub struct HttpEvaluator {
    endpoint: HttpEndpoint,
}

impl HttpEvaluator {
    pub fn new(url: Url, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            endpoint: HttpEndpoint::new("evaluation", url, api_key)?,
        })
    }
}

#[async_trait]
impl Evaluator for HttpEvaluator {
    async fn evaluate(
        &self,
        query: &str,
        chunks: &[String],
        answer: &str,
        call: &CallContext,
    ) -> Result<BTreeMap<String, f64>> {
        let body = EvaluateRequest {
            query,
            chunks,
            answer,
        };
        let response: EvaluateResponse = self.endpoint.post(&body, call).await?;
        Ok(response.metrics)
    }
}

// ---------------------------------------------------------------------------
// Fact check
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct FactCheckRequest<'a> {
    text: &'a str,
}

pub struct HttpFactChecker {
    endpoint: HttpEndpoint,
}

impl HttpFactChecker {
    pub fn new(url: Url, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            endpoint: HttpEndpoint::new("fact_check", url, api_key)?,
        })
    }
}

#[async_trait]
impl FactChecker for HttpFactChecker {
    async fn check(&self, text: &str, call: &CallContext) -> Result<FactScores> {
        self.endpoint.post(&FactCheckRequest { text }, call).await
    }
}
