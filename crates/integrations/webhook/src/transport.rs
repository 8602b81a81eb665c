use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument, warn};

use crate::config::{WebhookClientConfig, validate_endpoint};
use crate::error::WebhookError;
use crate::signing::{SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::types::{WebhookDelivery, WebhookResponse};

const MAX_BODY_CHARS: usize = 512;

/// Delivers signed webhook requests.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// POST `delivery` once. Any non-2xx status is an error.
    async fn deliver(&self, delivery: &WebhookDelivery) -> Result<WebhookResponse, WebhookError>;
}

/// [`WebhookTransport`] over `reqwest`. Redirects are never followed so a
/// subscriber cannot bounce deliveries to a plain-HTTP target.
pub struct HttpWebhookTransport {
    config: WebhookClientConfig,
    client: Client,
}

impl HttpWebhookTransport {
    pub fn new(config: WebhookClientConfig) -> Result<Self, WebhookError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| WebhookError::Client(e.to_string()))?;
        Ok(Self { config, client })
    }

    /// Use a caller-provided client, e.g. to share a connection pool.
    pub fn with_client(config: WebhookClientConfig, client: Client) -> Self {
        Self { config, client }
    }

    pub fn config(&self) -> &WebhookClientConfig {
        &self.config
    }
}

#[async_trait]
impl WebhookTransport for HttpWebhookTransport {
    #[instrument(skip_all, fields(url = %delivery.url))]
    async fn deliver(&self, delivery: &WebhookDelivery) -> Result<WebhookResponse, WebhookError> {
        let url = validate_endpoint(&delivery.url, self.config.allow_insecure)?;
        debug!(bytes = delivery.body.len(), "dispatching webhook");

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, &delivery.signature)
            .header(TIMESTAMP_HEADER, delivery.timestamp.to_string())
            .body(delivery.body.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    warn!("webhook request timed out");
                }
                WebhookError::Http(e)
            })?;

        let status_code = response.status().as_u16();
        let mut body = response.text().await.unwrap_or_default();
        if let Some((cut, _)) = body.char_indices().nth(MAX_BODY_CHARS) {
            body.truncate(cut);
        }

        if (200..300).contains(&status_code) {
            Ok(WebhookResponse { status_code, body })
        } else {
            warn!(status = status_code, "webhook endpoint rejected delivery");
            Err(WebhookError::UnexpectedStatus {
                status: status_code,
                body,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::signing::verify;

    /// A minimal mock HTTP server that answers one connection.
    struct MockWebhookServer {
        listener: tokio::net::TcpListener,
        url: String,
    }

    impl MockWebhookServer {
        async fn start() -> Self {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("failed to bind mock server");
            let port = listener.local_addr().unwrap().port();
            Self {
                listener,
                url: format!("http://127.0.0.1:{port}/hook"),
            }
        }

        /// Respond with `status_code` and `body`. Returns the raw request.
        async fn respond_once(self, status_code: u16, body: &str) -> String {
            let (mut stream, _) = self.listener.accept().await.unwrap();
            let mut buf = vec![0u8; 16384];
            let mut read = 0;
            // Read until the full body named by Content-Length has arrived.
            loop {
                let n = stream.read(&mut buf[read..]).await.unwrap();
                read += n;
                let text = String::from_utf8_lossy(&buf[..read]).to_string();
                if n == 0 || request_complete(&text) {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status_code} OK\r\n\
                 Content-Type: application/json\r\n\
                 Content-Length: {}\r\n\
                 Connection: close\r\n\
                 \r\n\
                 {body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
            String::from_utf8_lossy(&buf[..read]).to_string()
        }

        /// Accept a connection and never answer.
        async fn hang(self) {
            let (_stream, _) = self.listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
    }

    fn request_complete(raw: &str) -> bool {
        let Some((head, body)) = raw.split_once("\r\n\r\n") else {
            return false;
        };
        let length = head
            .lines()
            .find_map(|l| {
                let (name, value) = l.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        body.len() >= length
    }

    fn header<'a>(raw: &'a str, name: &str) -> Option<&'a str> {
        raw.lines().find_map(|l| {
            let (n, v) = l.split_once(':')?;
            n.eq_ignore_ascii_case(name).then(|| v.trim())
        })
    }

    fn transport() -> HttpWebhookTransport {
        HttpWebhookTransport::new(WebhookClientConfig::default().with_insecure_endpoints()).unwrap()
    }

    fn delivery(url: &str) -> WebhookDelivery {
        let payload = serde_json::json!({"type": "usage.threshold", "data": {"threshold": 80}});
        WebhookDelivery::new(url, "whsec_test", &payload, 1_760_000_000).unwrap()
    }

    #[tokio::test]
    async fn delivers_signed_post() {
        let server = MockWebhookServer::start().await;
        let url = server.url.clone();
        let handle = tokio::spawn(async move { server.respond_once(200, r#"{"ok":true}"#).await });

        let response = transport().deliver(&delivery(&url)).await.unwrap();
        let raw = handle.await.unwrap();

        assert_eq!(response.status_code, 200);
        assert!(raw.starts_with("POST /hook "));
        assert_eq!(header(&raw, "timestamp"), Some("1760000000"));
        let signature = header(&raw, "signature").unwrap();
        let body = raw.split_once("\r\n\r\n").unwrap().1;
        assert!(verify("whsec_test", 1_760_000_000, body.as_bytes(), signature));
    }

    #[tokio::test]
    async fn non_2xx_is_an_error() {
        let server = MockWebhookServer::start().await;
        let url = server.url.clone();
        let handle = tokio::spawn(async move { server.respond_once(500, "boom").await });

        let err = transport().deliver(&delivery(&url)).await.unwrap_err();
        handle.await.unwrap();
        assert!(matches!(err, WebhookError::UnexpectedStatus { status: 500, .. }));
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let server = MockWebhookServer::start().await;
        let url = server.url.clone();
        let handle = tokio::spawn(server.hang());

        let transport = HttpWebhookTransport::new(
            WebhookClientConfig::default()
                .with_insecure_endpoints()
                .with_timeout(Duration::from_millis(200)),
        )
        .unwrap();
        let err = transport.deliver(&delivery(&url)).await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
        handle.abort();
    }

    #[tokio::test]
    async fn plain_http_refused_by_default() {
        let transport = HttpWebhookTransport::new(WebhookClientConfig::default()).unwrap();
        let err = transport
            .deliver(&delivery("http://hooks.example.com/usage"))
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::InsecureUrl(_)));
    }
}
