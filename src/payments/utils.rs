use crate::payments::error::{PaymentError, PaymentResult};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 2;

/// Authentication carried on an outbound gateway request.
pub enum HttpAuth<'a> {
    Bearer(&'a str),
    Basic {
        username: &'a str,
        password: Option<&'a str>,
    },
}

/// Shared HTTP client for payment gateway calls.
///
/// Retry policy: 5xx responses are retried with exponential backoff;
/// replaying the same merchant transaction id is safe on both gateways.
/// Timeouts and connection failures are NOT retried here; the outcome of the
/// first attempt is unknown and retrying could double-submit. Callers decide
/// whether to re-drive the same transaction id later.
pub struct PaymentHttpClient {
    client: Client,
    max_retries: u32,
}

impl PaymentHttpClient {
    pub fn new(timeout_secs: Option<u64>, max_retries: Option<u32>) -> PaymentResult<Self> {
        let timeout = Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PaymentError::ConfigurationError {
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            max_retries: max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        })
    }

    /// Send a JSON request and decode the JSON response.
    ///
    /// Non-2xx responses become `GatewayUnavailable` with the status and raw
    /// body preserved, so the caller can log exactly what the gateway said.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        provider: &str,
        method: reqwest::Method,
        url: &str,
        headers: &[(&str, &str)],
        auth: Option<HttpAuth<'_>>,
        body: Option<&JsonValue>,
    ) -> PaymentResult<T> {
        for attempt in 0..=self.max_retries {
            let mut request = self.client.request(method.clone(), url);
            for (name, value) in headers {
                request = request.header(*name, *value);
            }
            match &auth {
                Some(HttpAuth::Bearer(token)) => {
                    request = request.bearer_auth(token);
                }
                Some(HttpAuth::Basic { username, password }) => {
                    request = request.basic_auth(username, *password);
                }
                None => {}
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) if e.is_timeout() => {
                    // Outcome unknown; surface immediately instead of
                    // re-submitting behind the caller's back.
                    return Err(PaymentError::GatewayUnavailable {
                        provider: provider.to_string(),
                        message: format!("request timed out: {}", e),
                        retryable: false,
                    });
                }
                Err(e) => {
                    return Err(PaymentError::GatewayUnavailable {
                        provider: provider.to_string(),
                        message: format!("request failed: {}", e),
                        retryable: false,
                    });
                }
            };

            let status = response.status();

            if status.as_u16() == 429 {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                if attempt < self.max_retries {
                    // Honor Retry-After but cap it; one slow gateway must not
                    // stall a sequential reconciler sweep for minutes.
                    let delay = retry_after.unwrap_or(1 << attempt).min(60);
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    continue;
                }
                return Err(PaymentError::RateLimitError {
                    message: format!("{} rate limited the request", provider),
                    retry_after_seconds: retry_after,
                });
            }

            if status.is_server_error() {
                let body_text = response.text().await.unwrap_or_default();
                if attempt < self.max_retries {
                    tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                    continue;
                }
                return Err(PaymentError::GatewayUnavailable {
                    provider: provider.to_string(),
                    message: format!("HTTP {}: {}", status.as_u16(), body_text),
                    retryable: true,
                });
            }

            if !status.is_success() {
                let body_text = response.text().await.unwrap_or_default();
                return Err(PaymentError::GatewayUnavailable {
                    provider: provider.to_string(),
                    message: format!("HTTP {}: {}", status.as_u16(), body_text),
                    retryable: false,
                });
            }

            let body_text =
                response
                    .text()
                    .await
                    .map_err(|e| PaymentError::GatewayUnavailable {
                        provider: provider.to_string(),
                        message: format!("failed to read response body: {}", e),
                        retryable: false,
                    })?;

            return serde_json::from_str::<T>(&body_text).map_err(|e| {
                PaymentError::GatewayUnavailable {
                    provider: provider.to_string(),
                    message: format!("malformed response ({}): {}", e, body_text),
                    retryable: false,
                }
            });
        }

        Err(PaymentError::GatewayUnavailable {
            provider: provider.to_string(),
            message: "retries exhausted".to_string(),
            retryable: true,
        })
    }
}

/// Generate a merchant transaction id: a caller prefix, millisecond
/// timestamp, and a short random suffix. URL-safe by construction, unique
/// enough for the ledger's uniqueness constraint to never fire in practice.
pub fn generate_transaction_id(prefix: &str) -> String {
    let timestamp = chrono::Utc::now().timestamp_millis();
    let random = Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", prefix, timestamp, &random[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Read one HTTP request off the socket: headers, then as much body as
    /// Content-Length promises.
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut raw = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&raw);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length: "))
                    .or_else(|| {
                        text.lines()
                            .find_map(|l| l.strip_prefix("Content-Length: "))
                    })
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if raw.len() >= header_end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&raw).into_owned()
    }

    fn body_of(request: &str) -> &str {
        request.split("\r\n\r\n").nth(1).unwrap_or("")
    }

    #[tokio::test]
    async fn timed_out_request_is_surfaced_without_a_second_attempt() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let seen = connections.clone();
        tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                seen.fetch_add(1, Ordering::SeqCst);
                // Hold the connection open and never answer.
                tokio::spawn(async move {
                    let _socket = socket;
                    tokio::time::sleep(Duration::from_secs(60)).await;
                });
            }
        });

        let client = PaymentHttpClient::new(Some(1), Some(2)).unwrap();
        let body = serde_json::json!({ "request": "payload" });
        let result: PaymentResult<JsonValue> = client
            .request_json(
                "stub",
                reqwest::Method::POST,
                &format!("http://{}/pay", addr),
                &[],
                None,
                Some(&body),
            )
            .await;

        match result {
            Err(PaymentError::GatewayUnavailable { retryable, .. }) => {
                assert!(!retryable, "a timeout must not be marked retryable")
            }
            other => panic!("expected GatewayUnavailable, got {:?}", other),
        }
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_errors_are_retried_with_an_identical_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(tokio::sync::Mutex::new(Vec::<String>::new()));
        let seen = requests.clone();
        tokio::spawn(async move {
            let mut served = 0usize;
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                let request = read_request(&mut socket).await;
                seen.lock().await.push(request);
                let response = if served < 2 {
                    "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 4\r\nConnection: close\r\n\r\ndown"
                } else {
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 16\r\nConnection: close\r\n\r\n{\"success\":true}"
                };
                served += 1;
                socket.write_all(response.as_bytes()).await.unwrap();
            }
        });

        let client = PaymentHttpClient::new(Some(5), Some(2)).unwrap();
        let body = serde_json::json!({ "merchantTransactionId": "SF_1_abc" });
        let decoded: JsonValue = client
            .request_json(
                "stub",
                reqwest::Method::POST,
                &format!("http://{}/pay", addr),
                &[],
                None,
                Some(&body),
            )
            .await
            .expect("third attempt should succeed");
        assert_eq!(decoded["success"], serde_json::json!(true));

        let requests = requests.lock().await;
        assert_eq!(requests.len(), 3);
        let first_body = body_of(&requests[0]).to_string();
        assert!(first_body.contains("SF_1_abc"));
        for request in requests.iter() {
            assert_eq!(body_of(request), first_body);
        }
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let seen = connections.clone();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                seen.fetch_add(1, Ordering::SeqCst);
                let _ = read_request(&mut socket).await;
                let response = "HTTP/1.1 400 Bad Request\r\nContent-Length: 3\r\nConnection: close\r\n\r\nbad";
                socket.write_all(response.as_bytes()).await.unwrap();
            }
        });

        let client = PaymentHttpClient::new(Some(5), Some(2)).unwrap();
        let result: PaymentResult<JsonValue> = client
            .request_json(
                "stub",
                reqwest::Method::GET,
                &format!("http://{}/status", addr),
                &[],
                None,
                None,
            )
            .await;

        match result {
            Err(PaymentError::GatewayUnavailable { retryable, message, .. }) => {
                assert!(!retryable);
                assert!(message.contains("400"));
            }
            other => panic!("expected GatewayUnavailable, got {:?}", other),
        }
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transaction_ids_are_unique() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(generate_transaction_id("SF")));
        }
    }

    #[test]
    fn transaction_ids_are_url_safe() {
        let id = generate_transaction_id("SF");
        assert!(id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    }

    #[test]
    fn transaction_ids_carry_the_prefix() {
        let id = generate_transaction_id("SF");
        assert!(id.starts_with("SF_"));
        assert_eq!(id.split('_').count(), 3);
    }
}
