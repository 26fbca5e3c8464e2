//! ClickHouse session over the HTTP interface.
//!
//! The session issues SQL over HTTPS with `JSONEachRow` as the result format,
//! one JSON object per line. Rows are decoded lazily as the response body
//! streams in, so a result set is never buffered wholesale. Structured server
//! exceptions (code, message, stack trace) are parsed from the
//! `X-ClickHouse-Exception-Code` header and the error body.

use std::marker::PhantomData;
use std::time::Duration;

use reqwest::Response;
use serde::de::DeserializeOwned;
use url::Url;

use crate::config::ConnectionInfo;
use crate::error::{ChdumpError, Result, ServerException};

/// Connection establishment timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Header carrying the numeric error code on failed requests.
const EXCEPTION_CODE_HEADER: &str = "x-clickhouse-exception-code";

/// An open, authenticated session to a ClickHouse server.
///
/// Owned exclusively by the calling thread for the duration of a run and
/// released on drop. One query is in flight at a time; there is no pooling.
pub struct Session {
    http: reqwest::Client,
    endpoint: Url,
    info: ConnectionInfo,
}

impl Session {
    /// Opens a session and verifies liveness with an authenticated round-trip.
    ///
    /// TLS certificate verification is on by default and disabled only when
    /// the descriptor carries the explicit `accept_invalid_certs` opt-in.
    ///
    /// # Errors
    /// Returns `ChdumpError::Connection` when the address is unreachable,
    /// the HTTP client cannot be built, or the server rejects the liveness
    /// check (authentication failure, unknown database). In the rejection
    /// case the structured server exception rides along as the error source.
    pub async fn connect(info: ConnectionInfo) -> Result<Self> {
        let endpoint = endpoint_url(&info)?;

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(info.accept_invalid_certs)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ChdumpError::connection_failed("building HTTP client", e))?;

        let session = Self {
            http,
            endpoint,
            info,
        };
        session.ping().await.map_err(map_ping_error)?;
        Ok(session)
    }

    /// Performs a lightweight authenticated round-trip (`SELECT 1`).
    ///
    /// # Errors
    /// `ChdumpError::Protocol` when the server returns a structured
    /// exception; `ChdumpError::Connection` for transport-level failures or
    /// non-exception error responses.
    pub async fn ping(&self) -> Result<()> {
        let response = self
            .request("SELECT 1")
            .send()
            .await
            .map_err(|e| ChdumpError::connection_failed("server is unreachable", e))?;

        if response.status().is_success() {
            return Ok(());
        }

        let status = response.status();
        match read_exception(response).await {
            Some(exception) => Err(ChdumpError::Protocol(exception)),
            None => Err(ChdumpError::connection_failed(
                "liveness check failed",
                std::io::Error::other(format!("server returned HTTP status {status}")),
            )),
        }
    }

    /// Issues one SQL statement and returns a lazy cursor over its rows.
    ///
    /// The cursor is forward-only and non-restartable; dropping it abandons
    /// the remaining rows and releases the underlying response body.
    ///
    /// # Errors
    /// `ChdumpError::Query` when the statement cannot be executed, with the
    /// server exception attached as the source when one was returned.
    pub async fn query<T: DeserializeOwned>(&self, sql: &str, context: &str) -> Result<RowCursor<T>> {
        tracing::debug!("executing query: {}", sql);

        let response = self
            .request(sql)
            .send()
            .await
            .map_err(|e| ChdumpError::query_failed(context, e))?;

        if response.status().is_success() {
            return Ok(RowCursor::new(response));
        }

        let status = response.status();
        let context = context.to_string();
        match read_exception(response).await {
            Some(exception) => Err(ChdumpError::query_failed(context, exception)),
            None => Err(ChdumpError::query_failed(
                context,
                std::io::Error::other(format!("server returned HTTP status {status}")),
            )),
        }
    }

    /// Builds an authenticated request carrying one SQL statement.
    fn request(&self, sql: &str) -> reqwest::RequestBuilder {
        self.http
            .post(self.endpoint.clone())
            .query(&[
                ("database", self.info.database.as_str()),
                ("default_format", "JSONEachRow"),
            ])
            .header("X-ClickHouse-User", &self.info.username)
            .header("X-ClickHouse-Key", &self.info.password)
            .body(sql.to_string())
    }
}

/// Builds the HTTP endpoint for a connection descriptor.
///
/// HTTPS unless the descriptor carries the explicit plain-HTTP opt-in; the
/// host (including any port) is used verbatim.
fn endpoint_url(info: &ConnectionInfo) -> Result<Url> {
    let scheme = if info.plain_http { "http" } else { "https" };
    Url::parse(&format!("{scheme}://{}/", info.host))
        .map_err(|e| ChdumpError::argument(format!("invalid host '{}': {e}", info.host)))
}

/// Reclassifies a liveness-check rejection as a connection failure.
///
/// The Connector contract treats authentication failures and unknown
/// databases as connection errors; the structured exception stays reachable
/// through the source chain for reporting.
fn map_ping_error(err: ChdumpError) -> ChdumpError {
    match err {
        exception @ ChdumpError::Protocol(_) => {
            ChdumpError::connection_failed("server rejected the liveness check", exception)
        }
        other => other,
    }
}

/// Lazy, forward-only cursor over the rows of one query result.
///
/// Each row is one line of `JSONEachRow` output, decoded on demand as body
/// chunks arrive. Dropping the cursor aborts the remaining body.
pub struct RowCursor<T> {
    response: Response,
    lines: LineBuffer,
    _marker: PhantomData<T>,
}

impl<T: DeserializeOwned> RowCursor<T> {
    fn new(response: Response) -> Self {
        Self {
            response,
            lines: LineBuffer::new(),
            _marker: PhantomData,
        }
    }

    /// Returns the next row, or `None` once the result set is consumed.
    ///
    /// # Errors
    /// `ChdumpError::RowRead` when a line cannot be decoded into `T` or the
    /// body stream fails mid-read.
    pub async fn next_row(&mut self) -> Result<Option<T>> {
        loop {
            if let Some(line) = self.lines.next_line() {
                if line.is_empty() {
                    continue;
                }
                return decode_row(&line).map(Some);
            }

            if self.lines.is_finished() {
                return Ok(None);
            }

            match self.response.chunk().await {
                Ok(Some(chunk)) => self.lines.push_chunk(&chunk),
                Ok(None) => self.lines.finish(),
                Err(e) => {
                    return Err(ChdumpError::row_read("reading result rows from server", e));
                }
            }
        }
    }
}

fn decode_row<T: DeserializeOwned>(line: &[u8]) -> Result<T> {
    serde_json::from_slice(line)
        .map_err(|e| ChdumpError::row_read("decoding result row", e))
}

/// Assembles complete lines out of streamed body chunks.
///
/// Chunks may split a line anywhere; a line is yielded only once its newline
/// arrives, except that after `finish` any buffered remainder is yielded as
/// the final line (servers may omit the trailing newline).
#[derive(Debug, Default)]
struct LineBuffer {
    buf: Vec<u8>,
    finished: bool,
}

impl LineBuffer {
    fn new() -> Self {
        Self::default()
    }

    /// Appends one body chunk.
    fn push_chunk(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Marks the body as fully received.
    fn finish(&mut self) {
        self.finished = true;
    }

    /// True once the body is fully received and every line was yielded.
    fn is_finished(&self) -> bool {
        self.finished && self.buf.is_empty()
    }

    /// Splits the next complete line off the front of the buffer.
    ///
    /// The trailing newline (and a carriage return, if any) is stripped.
    /// Returns `None` while the buffer holds no complete line yet.
    fn next_line(&mut self) -> Option<Vec<u8>> {
        if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Some(line);
        }

        if self.finished && !self.buf.is_empty() {
            // Final line without a trailing newline
            return Some(std::mem::take(&mut self.buf));
        }
        None
    }
}

/// Reads a structured server exception out of an error response.
///
/// Returns `None` when the response carries no recognizable exception, i.e.
/// neither the code header nor a `Code: N.` body prefix.
async fn read_exception(response: Response) -> Option<ServerException> {
    let header_code = response
        .headers()
        .get(EXCEPTION_CODE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i32>().ok());
    let body = response.text().await.unwrap_or_default();

    parse_exception(header_code, &body)
}

/// Parses an exception from the error code header and the response body.
///
/// ClickHouse error bodies look like
/// `Code: 516. DB::Exception: Authentication failed. Stack trace: ...`;
/// the stack trace is split off into its own field.
fn parse_exception(header_code: Option<i32>, body: &str) -> Option<ServerException> {
    let code = header_code.or_else(|| parse_body_code(body))?;

    let (message, stack_trace) = match body.split_once("Stack trace:") {
        Some((message, trace)) => (message.trim(), trace.trim()),
        None => (body.trim(), ""),
    };

    Some(ServerException {
        code,
        message: message.to_string(),
        stack_trace: stack_trace.to_string(),
    })
}

/// Extracts the numeric code from a `Code: N.` body prefix.
fn parse_body_code(body: &str) -> Option<i32> {
    let rest = body.trim_start().strip_prefix("Code:")?.trim_start();
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Quotes a table name as a ClickHouse backtick identifier.
///
/// Backticks and backslashes inside the name are backslash-escaped, so names
/// containing special characters cannot break out of the identifier.
pub fn quote_identifier(name: &str) -> String {
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('`');
    for c in name.chars() {
        if c == '`' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('`');
    quoted
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_identifier_plain() {
        assert_eq!(quote_identifier("events"), "`events`");
        assert_eq!(quote_identifier("user sessions"), "`user sessions`");
    }

    #[test]
    fn test_quote_identifier_escapes_backticks_and_backslashes() {
        assert_eq!(quote_identifier("odd`name"), "`odd\\`name`");
        assert_eq!(quote_identifier("back\\slash"), "`back\\\\slash`");
    }

    #[test]
    fn test_line_buffer_waits_for_complete_line() {
        let mut lines = LineBuffer::new();
        lines.push_chunk(b"partial");
        assert_eq!(lines.next_line(), None);

        lines.push_chunk(b" line\nrest");
        assert_eq!(lines.next_line(), Some(b"partial line".to_vec()));
        assert_eq!(lines.next_line(), None);
    }

    #[test]
    fn test_line_buffer_strips_carriage_return() {
        let mut lines = LineBuffer::new();
        lines.push_chunk(b"one\r\ntwo\n");
        assert_eq!(lines.next_line(), Some(b"one".to_vec()));
        assert_eq!(lines.next_line(), Some(b"two".to_vec()));
        assert_eq!(lines.next_line(), None);
        assert!(!lines.is_finished());
    }

    #[test]
    fn test_line_buffer_yields_final_line_without_trailing_newline() {
        let mut lines = LineBuffer::new();
        lines.push_chunk(b"{\"name\":\"events\"}\n{\"name\":\"users\"}");
        assert_eq!(lines.next_line(), Some(b"{\"name\":\"events\"}".to_vec()));
        assert_eq!(lines.next_line(), None);

        lines.finish();
        assert_eq!(lines.next_line(), Some(b"{\"name\":\"users\"}".to_vec()));
        assert_eq!(lines.next_line(), None);
        assert!(lines.is_finished());
    }

    #[test]
    fn test_line_buffer_finish_with_empty_buffer() {
        let mut lines = LineBuffer::new();
        lines.finish();
        assert_eq!(lines.next_line(), None);
        assert!(lines.is_finished());
    }

    #[test]
    fn test_endpoint_url_defaults_to_https() {
        let info = ConnectionInfo::from_url("chdump://alice@db.internal:9000/analytics").unwrap();
        let endpoint = endpoint_url(&info).unwrap();
        assert_eq!(endpoint.as_str(), "https://db.internal:9000/");
    }

    #[test]
    fn test_endpoint_url_plain_http_opt_in() {
        let info = ConnectionInfo::from_url("chdump://alice@localhost:8123/default")
            .unwrap()
            .with_plain_http(true);
        let endpoint = endpoint_url(&info).unwrap();
        assert_eq!(endpoint.as_str(), "http://localhost:8123/");
    }

    #[test]
    fn test_ping_exception_maps_to_connection_error() {
        let exception = ServerException {
            code: 516,
            message: "Authentication failed".to_string(),
            stack_trace: "0. Poco::Net".to_string(),
        };
        let mapped = map_ping_error(ChdumpError::Protocol(exception));

        assert!(matches!(mapped, ChdumpError::Connection { .. }));
        assert!(mapped.to_string().starts_with("Failed to open database"));
        assert_eq!(mapped.server_exception().unwrap().code, 516);
    }

    #[test]
    fn test_ping_transport_errors_pass_through() {
        let unreachable = ChdumpError::connection_failed(
            "server is unreachable",
            std::io::Error::other("connection refused"),
        );
        let mapped = map_ping_error(unreachable);

        assert!(mapped.to_string().contains("server is unreachable"));
        assert!(mapped.server_exception().is_none());
    }

    #[test]
    fn test_parse_exception_with_header_code() {
        let body = "Code: 516. DB::Exception: Authentication failed. Stack trace:\n\n0. Poco::Net";
        let exception = parse_exception(Some(516), body).unwrap();

        assert_eq!(exception.code, 516);
        assert!(exception.message.contains("Authentication failed"));
        assert!(!exception.message.contains("Poco::Net"));
        assert!(exception.stack_trace.contains("Poco::Net"));
    }

    #[test]
    fn test_parse_exception_code_from_body() {
        let exception = parse_exception(None, "Code: 81. DB::Exception: Database xyz does not exist").unwrap();

        assert_eq!(exception.code, 81);
        assert!(exception.message.contains("does not exist"));
        assert_eq!(exception.stack_trace, "");
    }

    #[test]
    fn test_parse_exception_requires_a_code() {
        assert!(parse_exception(None, "upstream proxy error").is_none());
        assert!(parse_exception(None, "").is_none());
    }
}
