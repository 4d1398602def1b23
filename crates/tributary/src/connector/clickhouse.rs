//! ClickHouse HTTP interface connector
//!
//! Each endpoint is a `host:port` (plain HTTP) or a full `http(s)://` URL of
//! a server's HTTP interface. Opening a connection pings the endpoint; every
//! statement is one `POST` request whose response status is checked, so a
//! statement the server rejects surfaces as [`Error::Query`].
//!
//! - Bulk rows travel in the request body as `JSONCompactEachRow`, one JSON
//!   array per row; the statement's `VALUES @bulk` tail becomes
//!   `FORMAT JSONCompactEachRow`
//! - Reads are decoded from `JSONCompact`
//! - Parameters bind to server-side placeholders `{p1:Type}`, `{p2:Type}`...
//!
//! # Example
//!
//! ```rust,ignore
//! use tributary::prelude::*;
//! use tributary::connector::clickhouse::ClickHouseConnector;
//!
//! let connector = ClickHouseConnector::new(ClickHouseConfig::new().with_database("analytics"))?;
//! let pool = FailoverPool::new(PoolConfig::new(["ch-1:8123", "ch-2:8123"]), connector)?;
//!
//! let mut conn = pool.rent()?;
//! let rows = conn.query("SELECT count() FROM events WHERE day = {p1:Date}", &[Value::from("2024-03-01")])?;
//! ```

use reqwest::blocking::{Client, Response};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use validator::Validate;

use crate::config::ClickHouseConfig;
use crate::connection::{Connection, Connector, BULK_PLACEHOLDER};
use crate::error::{Error, Result};
use crate::types::{format_timestamp, non_finite, Row, Value};

/// Row format used for bulk request bodies
const INSERT_FORMAT: &str = "JSONCompactEachRow";

/// Result format requested for reads
const RESULT_FORMAT: &str = "JSONCompact";

/// Response header carrying the server's exception code
const EXCEPTION_CODE_HEADER: &str = "X-ClickHouse-Exception-Code";

/// Response header carrying read/written counters
const SUMMARY_HEADER: &str = "X-ClickHouse-Summary";

/// Opens [`ClickHouseConnection`]s against the HTTP interface
#[derive(Debug, Clone)]
pub struct ClickHouseConnector {
    config: Arc<ClickHouseConfig>,
    client: Client,
}

impl ClickHouseConnector {
    /// Validate the settings and build the shared HTTP client
    pub fn new(config: ClickHouseConfig) -> Result<Self> {
        config.validate()?;

        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            config: Arc::new(config),
            client,
        })
    }

    /// Connector settings
    pub fn config(&self) -> &ClickHouseConfig {
        &self.config
    }
}

impl Connector for ClickHouseConnector {
    type Connection = ClickHouseConnection;

    fn connect(&self, endpoint: &str) -> Result<ClickHouseConnection> {
        self.connect_timeout(endpoint, self.config.request_timeout())
    }

    fn connect_timeout(&self, endpoint: &str, timeout: Duration) -> Result<ClickHouseConnection> {
        let base = base_url(endpoint)?;
        let ping = base
            .join("ping")
            .map_err(|e| Error::config(format!("invalid endpoint {}: {}", endpoint, e)))?;

        let response = self
            .client
            .get(ping)
            .timeout(timeout.min(self.config.request_timeout()))
            .send()
            .map_err(|e| transport_error(endpoint, e))?;

        if !response.status().is_success() {
            return Err(Error::connection(format!(
                "{} answered ping with {}",
                endpoint,
                response.status()
            )));
        }

        debug!(endpoint, "ClickHouse endpoint reachable");
        Ok(ClickHouseConnection {
            endpoint: endpoint.to_string(),
            base,
            client: self.client.clone(),
            config: Arc::clone(&self.config),
            open: true,
        })
    }
}

/// Connection opened by [`ClickHouseConnector`]
#[derive(Debug)]
pub struct ClickHouseConnection {
    endpoint: String,
    base: Url,
    client: Client,
    config: Arc<ClickHouseConfig>,
    open: bool,
}

/// One request against the HTTP interface
struct Request<'a> {
    /// Statement as the caller wrote it, kept for error reports
    sql: &'a str,
    /// Statement sent in the URL when the body carries data
    query: Option<&'a str>,
    params: &'a [Value],
    settings: &'a [(&'a str, &'a str)],
    body: Vec<u8>,
}

impl ClickHouseConnection {
    /// Base URL requests are sent to
    pub fn url(&self) -> &Url {
        &self.base
    }

    fn send(&mut self, request: Request<'_>) -> Result<Response> {
        if !self.open {
            return Err(Error::connection(format!(
                "connection to {} is closed",
                self.endpoint
            )));
        }

        let params = request
            .params
            .iter()
            .map(|value| param_text(value, request.sql))
            .collect::<Result<Vec<_>>>()?;

        let mut url = self.base.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("database", &self.config.database);
            pairs.append_pair("wait_end_of_query", "1");
            for (key, value) in request.settings {
                pairs.append_pair(key, value);
            }
            if let Some(query) = request.query {
                pairs.append_pair("query", query);
            }
            for (i, value) in params.iter().enumerate() {
                pairs.append_pair(&format!("param_p{}", i + 1), value);
            }
        }

        let sent = self
            .client
            .post(url)
            .basic_auth(&self.config.user, self.config.password.as_deref())
            .body(request.body)
            .send();

        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                self.open = false;
                return Err(transport_error(&self.endpoint, e));
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let code = response
            .headers()
            .get(EXCEPTION_CODE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response.text().unwrap_or_default();
        debug!(
            endpoint = %self.endpoint,
            status = status.as_u16(),
            code = code.as_deref().unwrap_or("-"),
            "Statement rejected"
        );

        let message = format!("{} answered {}: {}", self.endpoint, status, text.trim());
        match status {
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
                self.open = false;
                Err(Error::connection(message))
            }
            _ => Err(Error::query_with_sql(message, request.sql)),
        }
    }
}

impl Connection for ClickHouseConnection {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let response = self.send(Request {
            sql,
            query: None,
            params,
            settings: &[],
            body: sql.as_bytes().to_vec(),
        })?;
        Ok(written_rows(&response).unwrap_or(0))
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let response = self.send(Request {
            sql,
            query: None,
            params,
            settings: &[
                ("default_format", RESULT_FORMAT),
                ("output_format_json_quote_64bit_integers", "0"),
            ],
            body: sql.as_bytes().to_vec(),
        })?;

        let result: CompactResult = match response.json() {
            Ok(result) => result,
            Err(e) if e.is_decode() => {
                return Err(Error::Query {
                    message: format!("unreadable {} result from {}", RESULT_FORMAT, self.endpoint),
                    sql: Some(sql.to_string()),
                    source: Some(Box::new(e)),
                })
            }
            Err(e) => {
                self.open = false;
                return Err(transport_error(&self.endpoint, e));
            }
        };

        Ok(result
            .data
            .into_iter()
            .map(|cells| cells.into_iter().map(Value::from_json).collect())
            .collect())
    }

    fn execute_bulk(&mut self, sql: &str, rows: &[Row]) -> Result<u64> {
        let insert = insert_query(sql)?;
        let body = encode_rows(rows)?;
        let response = self.send(Request {
            sql,
            query: Some(&insert),
            params: &[],
            settings: &[("date_time_input_format", "best_effort")],
            body,
        })?;
        Ok(written_rows(&response).unwrap_or(rows.len() as u64))
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[derive(Deserialize)]
struct CompactResult {
    #[serde(default)]
    data: Vec<Vec<serde_json::Value>>,
}

#[derive(Deserialize)]
struct Summary {
    written_rows: String,
}

/// Rows the server reports as written, when it sends a summary
fn written_rows(response: &Response) -> Option<u64> {
    let header = response.headers().get(SUMMARY_HEADER)?.to_str().ok()?;
    let summary: Summary = serde_json::from_str(header).ok()?;
    summary.written_rows.parse().ok()
}

fn transport_error(endpoint: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::timeout(format!("request to {} timed out", endpoint))
    } else {
        Error::connection_with_source(format!("request to {} failed", endpoint), e)
    }
}

/// `host:port` gets the `http` scheme; explicit URLs must be http or https
fn base_url(endpoint: &str) -> Result<Url> {
    let endpoint = endpoint.trim();
    let raw = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    };

    let url = Url::parse(&raw)
        .map_err(|e| Error::config(format!("invalid endpoint {}: {}", endpoint, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(Error::config(format!(
            "endpoint {} uses unsupported scheme {}",
            endpoint, scheme
        ))),
    }
}

/// Rewrite `... VALUES @bulk` into `... FORMAT JSONCompactEachRow`
fn insert_query(sql: &str) -> Result<String> {
    let Some((head, tail)) = sql.split_once(BULK_PLACEHOLDER) else {
        return Err(Error::query_with_sql(
            format!("bulk statement has no {} placeholder", BULK_PLACEHOLDER),
            sql,
        ));
    };

    if !tail.trim().trim_end_matches(';').trim().is_empty() {
        return Err(Error::query_with_sql(
            format!("{} must end the bulk statement", BULK_PLACEHOLDER),
            sql,
        ));
    }

    let head = head.trim_end();
    let head = match head.len().checked_sub("VALUES".len()) {
        Some(at) if head.is_char_boundary(at) && head[at..].eq_ignore_ascii_case("VALUES") => {
            head[..at].trim_end()
        }
        _ => head,
    };

    Ok(format!("{} FORMAT {}", head, INSERT_FORMAT))
}

/// One JSON array per row, newline separated
fn encode_rows(rows: &[Row]) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(rows.len() * 32);
    for row in rows {
        let cells = row.iter().map(Value::to_json).collect::<Result<Vec<_>>>()?;
        serde_json::to_writer(&mut body, &cells)
            .map_err(|e| Error::internal(format!("cannot encode row: {}", e)))?;
        body.push(b'\n');
    }
    Ok(body)
}

/// Render a parameter in the escaped text form the server parses
fn param_text(value: &Value, sql: &str) -> Result<String> {
    let text = match value {
        Value::Null => "\\N".to_string(),
        Value::Bool(v) => v.to_string(),
        Value::Int64(v) => v.to_string(),
        Value::UInt64(v) => v.to_string(),
        Value::Float64(v) if v.is_finite() => v.to_string(),
        Value::Float64(v) => non_finite(*v).to_string(),
        Value::String(s) => escape_param(s),
        Value::DateTime(ts) => format_timestamp(ts),
        Value::Bytes(_) => match value.to_json()? {
            serde_json::Value::String(s) => escape_param(&s),
            other => other.to_string(),
        },
        Value::Array(_) => {
            return Err(Error::query_with_sql(
                "array parameters are not supported",
                sql,
            ))
        }
    };
    Ok(text)
}

fn escape_param(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}
