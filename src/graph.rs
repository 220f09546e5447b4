//! Access to the metadata graph.
//!
//! [`GraphStore`] is the string-level query/update capability the rest of
//! the crate builds on. [`SparqlClient`] implements it against a SPARQL 1.1
//! endpoint behind mu-authorization, either with sudo rights (delta-driven
//! work) or on behalf of the calling session (direct requests).

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// A single RDF term in a SPARQL JSON result binding.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Term {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    #[serde(default)]
    pub datatype: Option<String>,
}

pub type Binding = HashMap<String, Term>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Results {
    #[serde(default)]
    pub bindings: Vec<Binding>,
}

/// SPARQL 1.1 JSON results: `boolean` for ASK, `results` for SELECT.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub boolean: Option<bool>,
    #[serde(default)]
    pub results: Option<Results>,
}

impl QueryResponse {
    pub fn ask(value: bool) -> Self {
        Self {
            boolean: Some(value),
            results: None,
        }
    }

    pub fn select(bindings: Vec<Binding>) -> Self {
        Self {
            boolean: None,
            results: Some(Results { bindings }),
        }
    }

    /// ASK answer; a missing `boolean` counts as false.
    pub fn is_true(&self) -> bool {
        self.boolean.unwrap_or(false)
    }

    pub fn bindings(&self) -> &[Binding] {
        self.results
            .as_ref()
            .map(|r| r.bindings.as_slice())
            .unwrap_or(&[])
    }
}

/// Required value of `var` in a binding.
pub fn value<'a>(binding: &'a Binding, var: &str) -> Result<&'a str> {
    binding
        .get(var)
        .map(|t| t.value.as_str())
        .ok_or_else(|| anyhow!("binding is missing ?{}", var))
}

/// Optional value of `var` in a binding.
pub fn optional_value<'a>(binding: &'a Binding, var: &str) -> Option<&'a str> {
    binding.get(var).map(|t| t.value.as_str())
}

/// Read/write access to the metadata graph.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Run a read-only query (ASK or SELECT).
    async fn query(&self, query: &str) -> Result<QueryResponse>;

    /// Run an update. A `DELETE/INSERT … WHERE` is executed as one unit.
    async fn update(&self, update: &str) -> Result<()>;
}

/// On whose behalf a [`SparqlClient`] talks to mu-authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Bypass access checks (`mu-auth-sudo: true`).
    Sudo,
    /// Act as the calling session.
    Session {
        session_id: String,
        call_id: Option<String>,
    },
}

/// HTTP client for a SPARQL endpoint.
pub struct SparqlClient {
    endpoint: String,
    scope: Scope,
    http: reqwest::Client,
}

impl SparqlClient {
    pub fn new(endpoint: &str, scope: Scope, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build SPARQL HTTP client")?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            scope,
            http,
        })
    }

    fn request(&self, form: &[(&str, &str)]) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .post(&self.endpoint)
            .header("Accept", "application/sparql-results+json")
            .form(form);
        match &self.scope {
            Scope::Sudo => {
                req = req.header("mu-auth-sudo", "true");
            }
            Scope::Session {
                session_id,
                call_id,
            } => {
                req = req.header("mu-session-id", session_id);
                if let Some(call_id) = call_id {
                    req = req.header("mu-call-id", call_id);
                }
            }
        }
        req
    }

    async fn send(&self, form: &[(&str, &str)]) -> Result<reqwest::Response> {
        let response = self
            .request(form)
            .send()
            .await
            .with_context(|| format!("SPARQL request to {} failed", self.endpoint))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("SPARQL endpoint returned {}: {}", status, body);
        }
        Ok(response)
    }
}

#[async_trait]
impl GraphStore for SparqlClient {
    async fn query(&self, query: &str) -> Result<QueryResponse> {
        tracing::debug!(query, "executing SPARQL query");
        let response = self.send(&[("query", query)]).await?;
        response
            .json::<QueryResponse>()
            .await
            .context("SPARQL endpoint returned malformed JSON results")
    }

    async fn update(&self, update: &str) -> Result<()> {
        tracing::debug!(update, "executing SPARQL update");
        self.send(&[("update", update)]).await?;
        Ok(())
    }
}
