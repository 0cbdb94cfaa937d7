//! Moving one prepared payload to the upload endpoint.
//!
//! Two wire strategies share the [`Transport`] trait and are picked once, when
//! the settings are resolved. Transfers run through a [`TransferExecutor`] so
//! they keep going even if whoever asked for them stops waiting.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::future::retry_notify;
use backoff::{Error as BackoffError, ExponentialBackoffBuilder};
use clap::ValueEnum;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::TransportError;

mod binary;
mod multipart;

pub use binary::BinaryTransport;
pub use multipart::MultipartTransport;

pub const DEFAULT_UPLOAD_PATH: &str = "/api/screenshots";
pub const DEFAULT_AUTH_HEADER: &str = "X-Guest-Id";
pub const DEFAULT_FIELD_NAME: &str = "screenshots";
pub const DEFAULT_MIME_TYPE: &str = "application/gzip";

const NETWORK_ATTEMPTS: usize = 3;
const RETRY_BASE_DELAY_MS: u64 = 250;
const MAX_BACKOFF_SECS: u64 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Multipart,
    Binary,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Multipart => "multipart",
            TransportKind::Binary => "binary",
        }
    }
}

/// Fixed destination and credential for every transfer.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub base_url: String,
    pub path: String,
    pub auth_header: String,
    pub credential: String,
    pub field_name: String,
    pub mime_type: String,
}

impl Endpoint {
    pub fn url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if self.path.starts_with('/') {
            format!("{base}{}", self.path)
        } else {
            format!("{base}/{}", self.path)
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if self.credential.is_empty() {
            request
        } else {
            request.header(self.auth_header.as_str(), self.credential.as_str())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMetadata {
    pub asset_id: String,
    pub filename: String,
    pub user_id: String,
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub payload: PathBuf,
    pub metadata: UploadMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResponse {
    pub status: u16,
    pub body: String,
}

impl TransferResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn into_outcome(self) -> Result<(), TransportError> {
        if self.is_success() {
            Ok(())
        } else {
            Err(TransportError::rejected(self.status, &self.body))
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Performs one transfer. Any HTTP status comes back as a response;
    /// only failures to complete the exchange are errors.
    async fn send(&self, request: &TransferRequest) -> Result<TransferResponse, TransportError>;
}

pub fn build_transport(
    kind: TransportKind,
    endpoint: Endpoint,
    timeout: Duration,
) -> Result<Arc<dyn Transport>> {
    reqwest::multipart::Part::bytes(Vec::new())
        .mime_str(&endpoint.mime_type)
        .with_context(|| format!("invalid upload MIME type '{}'", endpoint.mime_type))?;
    let client = Client::builder()
        .timeout(timeout)
        .user_agent(concat!("shotup/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;
    Ok(match kind {
        TransportKind::Multipart => Arc::new(MultipartTransport::new(client, endpoint)),
        TransportKind::Binary => Arc::new(BinaryTransport::new(client, endpoint)),
    })
}

async fn read_payload(request: &TransferRequest) -> Result<Vec<u8>, TransportError> {
    tokio::fs::read(&request.payload)
        .await
        .map_err(|source| TransportError::Payload {
            path: request.payload.display().to_string(),
            source,
        })
}

/// Sends the request built by `build`, retrying only when the connection
/// itself could not be established.
async fn execute<F>(build: F) -> Result<TransferResponse, TransportError>
where
    F: Fn() -> Result<RequestBuilder, TransportError>,
{
    let attempts = Arc::new(AtomicUsize::new(0));
    let backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(RETRY_BASE_DELAY_MS))
        .with_multiplier(2.0)
        .with_randomization_factor(0.2)
        .with_max_interval(Duration::from_secs(MAX_BACKOFF_SECS))
        .with_max_elapsed_time(None)
        .build();

    retry_notify(
        backoff,
        || {
            let request = build();
            let attempts = Arc::clone(&attempts);
            async move {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                let request = request.map_err(BackoffError::permanent)?;
                match request.send().await {
                    Ok(response) => {
                        let status = response.status().as_u16();
                        let body = response.text().await.unwrap_or_default();
                        Ok(TransferResponse { status, body })
                    }
                    Err(err) => {
                        let error = TransportError::Network(err.to_string());
                        if err.is_connect() && attempt < NETWORK_ATTEMPTS {
                            Err(BackoffError::transient(error))
                        } else {
                            Err(BackoffError::permanent(error))
                        }
                    }
                }
            }
        },
        |err: TransportError, delay: Duration| {
            debug!(
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "retrying transfer after connection failure"
            );
        },
    )
    .await
}

/// Runs transfers on a long-lived runtime. Callers only hold a completion
/// signal, so dropping a caller leaves its transfer running to completion.
#[derive(Debug, Clone)]
pub struct TransferExecutor {
    handle: Handle,
}

impl TransferExecutor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    pub async fn submit(
        &self,
        transport: Arc<dyn Transport>,
        request: TransferRequest,
    ) -> Result<TransferResponse, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.handle.spawn(async move {
            let result = transport.send(&request).await;
            if tx.send(result).is_err() {
                debug!(
                    asset_id = %request.metadata.asset_id,
                    "transfer finished after its caller stopped waiting"
                );
            }
        });
        rx.await.unwrap_or(Err(TransportError::Abandoned))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn endpoint(base_url: &str) -> Endpoint {
        Endpoint {
            base_url: base_url.to_string(),
            path: "upload".to_string(),
            auth_header: DEFAULT_AUTH_HEADER.to_string(),
            credential: String::new(),
            field_name: DEFAULT_FIELD_NAME.to_string(),
            mime_type: DEFAULT_MIME_TYPE.to_string(),
        }
    }

    #[test]
    fn endpoint_url_joins_slashes() {
        assert_eq!(endpoint("http://host/").url(), "http://host/upload");
        let mut with_slash = endpoint("http://host");
        with_slash.path = "/api/screenshots".to_string();
        assert_eq!(with_slash.url(), "http://host/api/screenshots");
    }

    #[test]
    fn build_rejects_malformed_mime_type() {
        let mut bad = endpoint("http://host");
        bad.mime_type = "gzip".to_string();
        for kind in [TransportKind::Multipart, TransportKind::Binary] {
            let err = match build_transport(kind, bad.clone(), Duration::from_secs(5)) {
                Ok(_) => panic!("expected {} transport to be rejected", kind.as_str()),
                Err(err) => err,
            };
            assert!(err.to_string().contains("invalid upload MIME type 'gzip'"));
        }
        assert!(build_transport(
            TransportKind::Binary,
            endpoint("http://host"),
            Duration::from_secs(5)
        )
        .is_ok());
    }

    #[test]
    fn only_2xx_is_success() {
        let ok = TransferResponse {
            status: 201,
            body: String::new(),
        };
        assert!(ok.into_outcome().is_ok());
        let redirect = TransferResponse {
            status: 302,
            body: "moved".to_string(),
        };
        assert_eq!(
            redirect.into_outcome().unwrap_err().to_string(),
            "server responded 302: moved"
        );
    }

    struct SlowTransport {
        finished: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transport for SlowTransport {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn send(
            &self,
            _request: &TransferRequest,
        ) -> Result<TransferResponse, TransportError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(TransferResponse {
                status: 200,
                body: String::new(),
            })
        }
    }

    fn request() -> TransferRequest {
        TransferRequest {
            payload: PathBuf::from("/dev/null"),
            metadata: UploadMetadata {
                asset_id: "a".to_string(),
                filename: "a.png".to_string(),
                user_id: "u".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn abandoned_caller_does_not_cancel_transfer() {
        let finished = Arc::new(AtomicBool::new(false));
        let transport: Arc<dyn Transport> = Arc::new(SlowTransport {
            finished: Arc::clone(&finished),
        });
        let executor = TransferExecutor::current();

        let waited = tokio::time::timeout(
            Duration::from_millis(10),
            executor.submit(Arc::clone(&transport), request()),
        )
        .await;
        assert!(waited.is_err());
        assert!(!finished.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn executor_delivers_transport_result() {
        let transport: Arc<dyn Transport> = Arc::new(SlowTransport {
            finished: Arc::new(AtomicBool::new(false)),
        });
        let response = TransferExecutor::current()
            .submit(transport, request())
            .await
            .unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn refused_connection_is_a_network_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = build_transport(
            TransportKind::Binary,
            endpoint(&format!("http://{addr}")),
            Duration::from_secs(5),
        )
        .unwrap();
        let tmp = tempfile::TempDir::new().unwrap();
        let payload = tmp.path().join("a.gz");
        std::fs::write(&payload, b"data").unwrap();
        let mut req = request();
        req.payload = payload;

        let err = transport.send(&req).await.unwrap_err();
        assert!(matches!(err, TransportError::Network(_)));
    }
}
