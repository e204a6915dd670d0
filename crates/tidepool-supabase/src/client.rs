//! PostgREST client implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use tidepool::{Cursor, DataSource, Domain, Mutation, Page, PageRequest, SourceError};

use crate::SupabaseError;

/// PostgREST table for a domain. Domains use hyphens, tables use
/// underscores.
pub(crate) fn table_for(domain: &Domain) -> String {
    domain.as_str().replace('-', "_")
}

/// Render a filter value as a PostgREST operand.
fn operand(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Client for a Supabase project's PostgREST endpoint.
pub struct SupabaseClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl SupabaseClient {
    /// Create a new client for the given project URL and anon key.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn table_url(&self, domain: &Domain) -> String {
        format!("{}/rest/v1/{}", self.base_url, table_for(domain))
    }

    /// Query predicates for a page request: filter columns as equality
    /// tests, the cursor as a `created_at` upper bound.
    fn page_query(req: &PageRequest) -> Result<Vec<(String, String)>, SupabaseError> {
        let mut query = vec![
            ("select".to_string(), "*".to_string()),
            ("order".to_string(), "created_at.desc,id.desc".to_string()),
            ("limit".to_string(), req.limit.to_string()),
        ];
        if let Some(filter) = &req.filter {
            let columns = filter
                .as_object()
                .ok_or_else(|| SupabaseError::Filter("filter must be a JSON object".to_string()))?;
            for (column, value) in columns {
                query.push((column.clone(), format!("eq.{}", operand(value))));
            }
        }
        if let Some(before) = &req.before {
            match before.as_str().split_once('|') {
                // Keyset cursor: strictly older rows, with ids breaking
                // exact created_at ties so none are skipped.
                Some((ts, id)) => query.push((
                    "or".to_string(),
                    format!("(created_at.lt.{ts},and(created_at.eq.{ts},id.lt.{id}))"),
                )),
                // Plain timestamp cursor (the engine's fallback).
                None => {
                    query.push(("created_at".to_string(), format!("lt.{}", before.as_str())));
                }
            }
        }
        Ok(query)
    }

    async fn select_page(&self, req: &PageRequest) -> Result<Page, SupabaseError> {
        let url = self.table_url(&req.domain);
        let query = Self::page_query(req)?;
        debug!(table = %table_for(&req.domain), limit = req.limit, "fetching page");

        // Retry up to 4 times: initial + 3 retries with backoff
        let mut last_error = None;
        for attempt in 0..4 {
            let response = self
                .http
                .get(&url)
                .query(&query)
                .header("apikey", &self.api_key)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .send()
                .await
                .map_err(SupabaseError::from);

            let result = match response {
                Ok(response) => Self::handle_response(response).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(body) => {
                    let mut rows = match body {
                        Value::Array(rows) => rows,
                        other => {
                            return Err(SupabaseError::InvalidResponse(format!(
                                "expected a row array, got {}",
                                other
                            )));
                        }
                    };
                    let has_more = rows.len() == req.limit;
                    // PostgREST returns newest first; pages are ascending.
                    rows.reverse();
                    // Keyset cursor from the oldest returned row, so the
                    // next page can tie-break rows sharing its created_at.
                    let next_cursor = rows.first().and_then(|row| {
                        let ts = row.get("created_at")?.as_str()?;
                        let id = row.get("id")?.as_str()?;
                        Some(Cursor::from(format!("{}|{}", ts, id)))
                    });
                    return Ok(Page {
                        rows,
                        next_cursor,
                        has_more,
                    });
                }
                Err(e) if e.is_transient() && attempt < 3 => {
                    let backoff_ms = 500 * (1 << attempt); // 500ms, 1s, 2s
                    warn!(
                        attempt = attempt + 1,
                        backoff_ms,
                        error = %e,
                        "transient error in fetch_page, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| SupabaseError::InvalidResponse("retry exhausted".to_string())))
    }

    async fn apply_mutation(
        &self,
        domain: &Domain,
        mutation: &Mutation,
    ) -> Result<Value, SupabaseError> {
        let url = self.table_url(domain);

        // Retry up to 4 times: initial + 3 retries with backoff
        let mut last_error = None;
        for attempt in 0..4 {
            let request = match mutation {
                Mutation::Insert { row } => self.http.post(&url).json(row),
                Mutation::Update { id, patch } => self
                    .http
                    .patch(&url)
                    .query(&[("id", format!("eq.{}", id))])
                    .json(patch),
                Mutation::Delete { id } => self
                    .http
                    .delete(&url)
                    .query(&[("id", format!("eq.{}", id))]),
            };

            let response = request
                .header("apikey", &self.api_key)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Prefer", "return=representation")
                .send()
                .await
                .map_err(SupabaseError::from);

            let result = match response {
                Ok(response) => Self::handle_response(response).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(body) => return Self::first_row(body),
                Err(e) if e.is_transient() && attempt < 3 => {
                    let backoff_ms = 500 * (1 << attempt); // 500ms, 1s, 2s
                    warn!(
                        attempt = attempt + 1,
                        backoff_ms,
                        error = %e,
                        "transient error in mutate, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| SupabaseError::InvalidResponse("retry exhausted".to_string())))
    }

    /// PostgREST representations are arrays even for single-row writes.
    fn first_row(body: Value) -> Result<Value, SupabaseError> {
        match body {
            Value::Array(mut rows) if !rows.is_empty() => Ok(rows.remove(0)),
            Value::Array(_) => Err(SupabaseError::InvalidResponse(
                "empty representation".to_string(),
            )),
            row @ Value::Object(_) => Ok(row),
            other => Err(SupabaseError::InvalidResponse(format!(
                "expected a row, got {}",
                other
            ))),
        }
    }

    async fn handle_response(response: reqwest::Response) -> Result<Value, SupabaseError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        #[derive(serde::Deserialize)]
        struct ErrorBody {
            message: String,
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.message)
            .unwrap_or(text);
        Err(SupabaseError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl DataSource for SupabaseClient {
    async fn fetch_page(&self, req: &PageRequest) -> Result<Page, SourceError> {
        Ok(self.select_page(req).await?)
    }

    async fn mutate(&self, domain: &Domain, mutation: Mutation) -> Result<Value, SourceError> {
        Ok(self.apply_mutation(domain, &mutation).await?)
    }
}
