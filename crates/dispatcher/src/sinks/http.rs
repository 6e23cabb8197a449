//! HttpSink - POSTs each message value to an endpoint

use std::collections::HashMap;
use std::ops::Range;
use std::time::Duration;

use contracts::{Message, Sink, SinkError};
use futures::future::join_all;
use observability::metrics;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, info, instrument, warn};

/// Status codes that make a message eligible for retry
///
/// Parsed from `"429,500-600"`; a range includes its start and excludes its
/// end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryableStatus {
    ranges: Vec<Range<u16>>,
}

impl RetryableStatus {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let ranges = raw
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| {
                let parse = |s: &str| {
                    s.trim()
                        .parse::<u16>()
                        .map_err(|e| format!("invalid status code '{}': {}", s, e))
                };
                match item.split_once('-') {
                    Some((start, end)) => {
                        let (start, end) = (parse(start)?, parse(end)?);
                        if start >= end {
                            return Err(format!("empty status range '{}'", item));
                        }
                        Ok(start..end)
                    }
                    None => {
                        let code = parse(item)?;
                        Ok(code..code.saturating_add(1))
                    }
                }
            })
            .collect::<Result<Vec<_>, String>>()?;

        Ok(Self { ranges })
    }

    pub fn contains(&self, status: u16) -> bool {
        self.ranges.iter().any(|range| range.contains(&status))
    }
}

impl Default for RetryableStatus {
    fn default() -> Self {
        Self {
            ranges: vec![400..600],
        }
    }
}

/// Configuration for HttpSink
#[derive(Debug, Clone)]
pub struct HttpSinkConfig {
    pub url: String,
    pub content_type: String,
    pub timeout: Duration,
    pub retryable: RetryableStatus,
}

impl HttpSinkConfig {
    /// Create config from params map
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, String> {
        let url = params
            .get("url")
            .cloned()
            .ok_or_else(|| "missing 'url' parameter".to_string())?;

        let timeout_ms: u64 = match params.get("timeout_ms") {
            Some(value) => value
                .parse()
                .map_err(|e| format!("invalid timeout_ms: {}", e))?,
            None => 10_000,
        };

        let retryable = match params.get("retry_status_codes") {
            Some(raw) => RetryableStatus::parse(raw)?,
            None => RetryableStatus::default(),
        };

        Ok(Self {
            url,
            content_type: params
                .get("content_type")
                .cloned()
                .unwrap_or_else(|| "application/json".to_string()),
            timeout: Duration::from_millis(timeout_ms),
            retryable,
        })
    }
}

enum Delivery {
    Delivered,
    Retry,
    Rejected,
}

/// Sink that posts messages over HTTP
pub struct HttpSink {
    name: String,
    config: HttpSinkConfig,
    client: Option<reqwest::Client>,
    staged: Vec<Message>,
}

impl HttpSink {
    pub fn new(name: impl Into<String>, config: HttpSinkConfig) -> Result<Self, SinkError> {
        let name = name.into();
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SinkError::connection(&name, e.to_string()))?;

        Ok(Self {
            name,
            config,
            client: Some(client),
            staged: Vec::new(),
        })
    }

    /// Create from params map (for factory)
    pub fn from_params(
        name: impl Into<String>,
        params: &HashMap<String, String>,
    ) -> Result<Self, SinkError> {
        let name = name.into();
        let config =
            HttpSinkConfig::from_params(params).map_err(|e| SinkError::connection(&name, e))?;
        Self::new(name, config)
    }

    async fn post(&self, client: &reqwest::Client, message: &Message) -> Delivery {
        let response = client
            .post(&self.config.url)
            .header(CONTENT_TYPE, &self.config.content_type)
            .body(message.value.clone())
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => Delivery::Delivered,
            Ok(response) => {
                let status = response.status().as_u16();
                if self.config.retryable.contains(status) {
                    warn!(
                        sink = %self.name,
                        status,
                        partition = message.partition,
                        offset = message.offset,
                        "Retryable HTTP status"
                    );
                    Delivery::Retry
                } else {
                    warn!(
                        sink = %self.name,
                        status,
                        partition = message.partition,
                        offset = message.offset,
                        "Non-retryable HTTP status, message dropped"
                    );
                    Delivery::Rejected
                }
            }
            Err(e) => {
                warn!(
                    sink = %self.name,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "HTTP request failed"
                );
                Delivery::Retry
            }
        }
    }
}

impl Sink for HttpSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&mut self, batch: &[Message]) -> Result<(), SinkError> {
        self.staged = batch.to_vec();
        Ok(())
    }

    #[instrument(
        name = "http_sink_execute",
        skip(self),
        fields(sink = %self.name, staged = self.staged.len())
    )]
    async fn execute(&mut self) -> Result<Vec<Message>, SinkError> {
        let staged = std::mem::take(&mut self.staged);
        if staged.is_empty() {
            return Ok(Vec::new());
        }
        let client = self
            .client
            .clone()
            .ok_or_else(|| SinkError::closed(&self.name))?;

        let deliveries = join_all(staged.iter().map(|message| self.post(&client, message))).await;

        let mut failed = Vec::new();
        let mut rejected = 0;
        for (message, delivery) in staged.into_iter().zip(deliveries) {
            match delivery {
                Delivery::Delivered => {}
                Delivery::Retry => failed.push(message),
                Delivery::Rejected => rejected += 1,
            }
        }
        if rejected > 0 {
            metrics::record_message_dropped(&self.name, "rejected_status", rejected);
        }

        Ok(failed)
    }

    #[instrument(name = "http_sink_close", skip(self), fields(sink = %self.name))]
    async fn close(&mut self) -> Result<(), SinkError> {
        if self.client.take().is_none() {
            debug!(sink = %self.name, "HttpSink already closed");
            return Ok(());
        }
        self.staged.clear();
        info!(sink = %self.name, "HttpSink closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers 503 for bodies containing "retry-me", 404 for "reject-me",
    /// 200 otherwise
    async fn start_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let request = read_request(&mut socket).await;
                    let response = if request.contains("retry-me") {
                        "HTTP/1.1 503 SERVICE UNAVAILABLE\r\ncontent-length: 0\r\n\r\n"
                    } else if request.contains("reject-me") {
                        "HTTP/1.1 404 NOT FOUND\r\ncontent-length: 0\r\n\r\n"
                    } else {
                        "HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n"
                    };
                    socket.write_all(response.as_bytes()).await.unwrap();
                });
            }
        });
        format!("http://{}/ingest", addr)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut data = Vec::new();
        let mut buffer = [0; 1024];
        loop {
            let n = socket.read(&mut buffer).await.unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buffer[..n]);

            let text = String::from_utf8_lossy(&data).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                if data.len() >= header_end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&data).to_string()
    }

    fn sink(url: String, retry_status_codes: &str) -> HttpSink {
        HttpSink::new(
            "http",
            HttpSinkConfig {
                url,
                content_type: "application/json".to_string(),
                timeout: Duration::from_secs(5),
                retryable: RetryableStatus::parse(retry_status_codes).unwrap(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_status_classification() {
        let url = start_server().await;
        let mut sink = sink(url, "500-600");

        let ok = Message::new("", r#"{"n":1}"#, "t", 0, 0);
        let retry = Message::new("", r#"{"n":"retry-me"}"#, "t", 0, 1);
        let reject = Message::new("", r#"{"n":"reject-me"}"#, "t", 0, 2);

        sink.prepare(&[ok, retry.clone(), reject]).unwrap();
        let failed = sink.execute().await.unwrap();
        assert_eq!(failed, vec![retry]);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_retries_all() {
        // Bind then drop to get a closed port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut sink = sink(format!("http://{}/", addr), "400-600");
        let batch = vec![
            Message::new("", "{}", "t", 0, 0),
            Message::new("", "{}", "t", 0, 1),
        ];
        sink.prepare(&batch).unwrap();
        assert_eq!(sink.execute().await.unwrap(), batch);
    }

    #[tokio::test]
    async fn test_close_twice() {
        let mut sink = sink("http://127.0.0.1:1/".to_string(), "400-600");
        sink.close().await.unwrap();
        sink.close().await.unwrap();
        sink.prepare(&[Message::new("", "{}", "t", 0, 0)]).unwrap();
        assert!(matches!(
            sink.execute().await.unwrap_err(),
            SinkError::Closed { .. }
        ));
    }

    #[test]
    fn test_retryable_status_parse() {
        let codes = RetryableStatus::parse("429, 500-600").unwrap();
        assert!(codes.contains(429));
        assert!(!codes.contains(430));
        assert!(codes.contains(500));
        assert!(codes.contains(599));
        assert!(!codes.contains(600));

        assert!(RetryableStatus::default().contains(404));
        assert!(RetryableStatus::parse("600-500").is_err());
        assert!(RetryableStatus::parse("abc").is_err());
    }
}
