//! PostgREST-style HTTP backend (`/rest/v1/{collection}`), the shape spoken by
//! hosted backend-as-a-service databases.

use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tally_core::{id_key, record_id, DataError, DataResult, QuerySpec, Record};
use tracing::{debug, info};

use crate::RemoteTable;

pub struct RestTable {
    base: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

/// Error body returned by PostgREST (`{"code": "...", "message": "..."}`).
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
}

/// Render a filter value as a PostgREST operator expression.
pub fn eq_param(value: &Value) -> String {
    match value {
        Value::Null => "is.null".to_string(),
        Value::String(s) => format!("eq.{}", s),
        other => format!("eq.{}", other),
    }
}

/// Query-string parameters for a read.
pub fn read_params(spec: &QuerySpec) -> Vec<(String, String)> {
    let mut params = Vec::with_capacity(spec.filter.len() + 3);
    params.push(("select".to_string(), spec.selection.render()));
    for (field, value) in spec.filter.iter() {
        params.push((field.clone(), eq_param(value)));
    }
    if let Some(o) = &spec.order_by {
        params.push(("order".to_string(), format!("{}.{}", o.field, if o.ascending { "asc" } else { "desc" })));
    }
    if let Some(n) = spec.limit {
        params.push(("limit".to_string(), n.to_string()));
    }
    params
}

fn transport(err: reqwest::Error) -> DataError {
    if err.is_timeout() {
        DataError::transport(format!("request timed out: {}", err))
    } else {
        DataError::transport(err.to_string())
    }
}

impl RestTable {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> DataResult<Self> {
        let http = reqwest::Client::builder().build().map_err(transport)?;
        Ok(Self { base: base_url.into().trim_end_matches('/').to_string(), api_key, http })
    }

    /// Build from `TALLY_REST_URL` / `TALLY_REST_KEY`.
    pub fn from_env() -> DataResult<Self> {
        let url = std::env::var("TALLY_REST_URL")
            .map_err(|_| DataError::validation_code("config", "TALLY_REST_URL is not set"))?;
        Self::new(url, std::env::var("TALLY_REST_KEY").ok())
    }

    fn url(&self, collection: &str) -> String { format!("{}/rest/v1/{}", self.base, collection) }

    fn request(&self, method: Method, collection: &str) -> RequestBuilder {
        let mut rb = self.http.request(method, self.url(collection)).header("Accept", "application/json");
        if let Some(key) = &self.api_key {
            rb = rb.header("apikey", key).bearer_auth(key);
        }
        rb
    }

    async fn send(&self, op: &'static str, collection: &str, rb: RequestBuilder) -> DataResult<Response> {
        let t0 = Instant::now();
        let resp = rb.send().await.map_err(transport);
        histogram!("rest_request_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
        let resp = resp?;
        let status = resp.status();
        debug!(op, collection, status = status.as_u16(), took_ms = %t0.elapsed().as_millis(), "rest: response");
        if status.is_success() {
            return Ok(resp);
        }
        counter!("rest_errors_total", 1u64, "op" => op);
        let text = resp.text().await.unwrap_or_default();
        let body: ErrorBody = serde_json::from_str(&text).unwrap_or_default();
        let message = body.message.unwrap_or_else(|| if text.is_empty() { status.to_string() } else { text.clone() });
        info!(op, collection, status = status.as_u16(), code = ?body.code, message = %message, "rest: request rejected");
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(DataError::transport(format!("{}: {}", status, message)))
        } else {
            Err(DataError::Validation { code: body.code, message })
        }
    }

    async fn rows(resp: Response) -> DataResult<Vec<Record>> {
        resp.json::<Vec<Record>>().await.map_err(|e| DataError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RemoteTable for RestTable {
    fn backend(&self) -> &'static str { "rest" }

    async fn read(&self, spec: &QuerySpec) -> DataResult<Vec<Record>> {
        let rb = self.request(Method::GET, &spec.collection).query(&read_params(spec));
        let resp = self.send("read", &spec.collection, rb).await?;
        Self::rows(resp).await
    }

    async fn insert(&self, collection: &str, record: Record) -> DataResult<Record> {
        let rb = self
            .request(Method::POST, collection)
            .header("Prefer", "return=representation")
            .json(&record);
        let resp = self.send("insert", collection, rb).await?;
        Self::rows(resp)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DataError::Decode("insert returned no representation".into()))
    }

    async fn update(&self, collection: &str, patch: Record) -> DataResult<Record> {
        let id = record_id(&patch)
            .cloned()
            .ok_or_else(|| DataError::validation_code("missing_id", "update payload requires id"))?;
        let rb = self
            .request(Method::PATCH, collection)
            .query(&[("id", eq_param(&id))])
            .header("Prefer", "return=representation")
            .json(&patch);
        let resp = self.send("update", collection, rb).await?;
        Self::rows(resp)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DataError::not_found(collection, id_key(&id)))
    }

    async fn delete(&self, collection: &str, id: &Value) -> DataResult<()> {
        let rb = self
            .request(Method::DELETE, collection)
            .query(&[("id", eq_param(id))])
            .header("Prefer", "return=representation");
        let resp = self.send("delete", collection, rb).await?;
        if Self::rows(resp).await?.is_empty() {
            return Err(DataError::not_found(collection, id_key(id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn read_params_cover_every_part() {
        let spec = QuerySpec::new("purchase_orders")
            .select(["id", "status"])
            .eq("status", "open")
            .eq("vendor_id", 4)
            .order_by("created_at", false)
            .limit(25);
        let params = read_params(&spec);
        assert_eq!(
            params,
            vec![
                ("select".to_string(), "id,status".to_string()),
                ("status".to_string(), "eq.open".to_string()),
                ("vendor_id".to_string(), "eq.4".to_string()),
                ("order".to_string(), "created_at.desc".to_string()),
                ("limit".to_string(), "25".to_string()),
            ]
        );
    }

    #[test]
    fn eq_param_renders_scalars() {
        assert_eq!(eq_param(&json!(true)), "eq.true");
        assert_eq!(eq_param(&json!(null)), "is.null");
        assert_eq!(eq_param(&json!("a b")), "eq.a b");
        assert_eq!(eq_param(&json!(1.5)), "eq.1.5");
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let t = RestTable::new("https://db.example.com/", None).unwrap();
        assert_eq!(t.url("items"), "https://db.example.com/rest/v1/items");
    }
}
