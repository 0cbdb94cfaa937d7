use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use urlencoding::encode;

use super::{execute, read_payload, Endpoint, TransferRequest, TransferResponse, Transport};
use crate::error::TransportError;

/// Raw-body POST; metadata travels in the query string.
#[derive(Debug, Clone)]
pub struct BinaryTransport {
    client: Client,
    endpoint: Endpoint,
}

impl BinaryTransport {
    pub fn new(client: Client, endpoint: Endpoint) -> Self {
        Self { client, endpoint }
    }

    fn url(&self, request: &TransferRequest) -> String {
        let metadata = &request.metadata;
        format!(
            "{}?filename={}&userId={}&assetId={}",
            self.endpoint.url(),
            encode(&metadata.filename),
            encode(&metadata.user_id),
            encode(&metadata.asset_id)
        )
    }
}

#[async_trait]
impl Transport for BinaryTransport {
    fn name(&self) -> &'static str {
        "binary"
    }

    async fn send(&self, request: &TransferRequest) -> Result<TransferResponse, TransportError> {
        let bytes = read_payload(request).await?;
        let url = self.url(request);
        execute(|| {
            Ok(self
                .endpoint
                .authorize(self.client.post(&url))
                .header(CONTENT_TYPE, self.endpoint.mime_type.as_str())
                .body(bytes.clone()))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_server::serve_once;
    use crate::transport::UploadMetadata;
    use tempfile::TempDir;

    #[tokio::test]
    async fn posts_raw_body_with_encoded_metadata() {
        let tmp = TempDir::new().unwrap();
        let payload = tmp.path().join("abc.gz");
        std::fs::write(&payload, b"RAW-BYTES").unwrap();
        let (base_url, server) = serve_once(200, "").await;

        let transport = BinaryTransport::new(
            Client::new(),
            Endpoint {
                base_url,
                path: "/upload".to_string(),
                auth_header: "X-Guest-Id".to_string(),
                credential: "guest-1".to_string(),
                field_name: "unused".to_string(),
                mime_type: "image/jpeg".to_string(),
            },
        );
        let response = transport
            .send(&TransferRequest {
                payload,
                metadata: UploadMetadata {
                    asset_id: "abc".to_string(),
                    filename: "my shot.png".to_string(),
                    user_id: "u&1".to_string(),
                },
            })
            .await
            .unwrap();
        assert_eq!(response.status, 200);

        let raw = server.await.unwrap();
        let lower = raw.to_lowercase();
        assert!(raw.starts_with("POST /upload?filename=my%20shot.png&userId=u%261&assetId=abc "));
        assert!(lower.contains("content-type: image/jpeg"));
        assert!(lower.contains("x-guest-id: guest-1"));
        assert!(raw.ends_with("RAW-BYTES"));
    }
}
