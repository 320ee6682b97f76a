use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::trace;

use super::{ByteStream, Transport, TransportError};
use crate::credentials::Credentials;

/// HTTP(S) transport backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Build a client with the crate user agent and the given timeouts.
    ///
    /// `read_timeout` bounds the gap between body chunks, not the whole
    /// download, so large artifacts are not cut off.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Network`] if the TLS backend cannot be
    /// initialized.
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(crate::USER_AGENT)
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .pool_max_idle_per_host(16)
            .build()
            .map_err(|e| TransportError::Network {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }

    /// Wrap an existing client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn map_reqwest(url: &str, e: &reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout {
            url: url.to_string(),
        }
    } else {
        TransportError::Network {
            url: url.to_string(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(
        &self,
        url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<ByteStream, TransportError> {
        trace!("GET {url}");
        let mut request = self.client.get(url);
        if let Some(creds) = credentials {
            request = request.basic_auth(creds.username(), Some(creds.password()));
        }

        let response = request.send().await.map_err(|e| map_reqwest(url, &e))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(TransportError::NotFound {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let owned_url = url.to_string();
        Ok(response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| map_reqwest(&owned_url, &e)))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::collect_body;

    fn transport() -> HttpTransport {
        HttpTransport::new(Duration::from_secs(5), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn fetches_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/org/example/lib/versions.json")
            .with_status(200)
            .with_body(r#"{"versions":["1.0"]}"#)
            .create_async()
            .await;

        let url = format!("{}/org/example/lib/versions.json", server.url());
        let body = collect_body(transport().get(&url, None).await.unwrap())
            .await
            .unwrap();
        assert_eq!(&body[..], br#"{"versions":["1.0"]}"#);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn maps_statuses() {
        let mut server = mockito::Server::new_async().await;
        let _missing = server
            .mock("GET", "/missing")
            .with_status(404)
            .create_async()
            .await;
        let _busy = server
            .mock("GET", "/busy")
            .with_status(503)
            .create_async()
            .await;

        let t = transport();
        let err = t
            .get(&format!("{}/missing", server.url()), None)
            .await
            .err()
            .unwrap();
        assert!(err.is_not_found());

        let err = t
            .get(&format!("{}/busy", server.url()), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Status { status: 503, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn sends_basic_auth() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/private")
            .match_header("authorization", "Basic dXNlcjpwYXNz")
            .with_status(200)
            .with_body("secret")
            .create_async()
            .await;

        let creds = Credentials::new("user", "pass");
        let url = format!("{}/private", server.url());
        let body = collect_body(transport().get(&url, Some(&creds)).await.unwrap())
            .await
            .unwrap();
        assert_eq!(&body[..], b"secret");
        mock.assert_async().await;
    }
}
