use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;

use super::{execute, read_payload, Endpoint, TransferRequest, TransferResponse, Transport};
use crate::error::TransportError;

/// `multipart/form-data` POST with the payload under the configured field.
#[derive(Debug, Clone)]
pub struct MultipartTransport {
    client: Client,
    endpoint: Endpoint,
}

impl MultipartTransport {
    pub fn new(client: Client, endpoint: Endpoint) -> Self {
        Self { client, endpoint }
    }

    fn form(&self, bytes: Vec<u8>, request: &TransferRequest) -> Result<Form, TransportError> {
        let part = Part::bytes(bytes)
            .file_name(request.metadata.filename.clone())
            .mime_str(&self.endpoint.mime_type)
            .map_err(|err| {
                TransportError::InvalidRequest(format!(
                    "invalid MIME type {}: {err}",
                    self.endpoint.mime_type
                ))
            })?;
        Ok(Form::new()
            .text("userId", request.metadata.user_id.clone())
            .text("assetId", request.metadata.asset_id.clone())
            .part(self.endpoint.field_name.clone(), part))
    }
}

#[async_trait]
impl Transport for MultipartTransport {
    fn name(&self) -> &'static str {
        "multipart"
    }

    async fn send(&self, request: &TransferRequest) -> Result<TransferResponse, TransportError> {
        let bytes = read_payload(request).await?;
        let url = self.endpoint.url();
        execute(|| {
            let form = self.form(bytes.clone(), request)?;
            Ok(self
                .endpoint
                .authorize(self.client.post(&url))
                .multipart(form))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_server::serve_once;
    use crate::transport::{UploadMetadata, DEFAULT_FIELD_NAME, DEFAULT_MIME_TYPE};
    use tempfile::TempDir;

    fn transport(base_url: &str) -> MultipartTransport {
        MultipartTransport::new(
            Client::new(),
            Endpoint {
                base_url: base_url.to_string(),
                path: "/api/screenshots".to_string(),
                auth_header: "X-Guest-Id".to_string(),
                credential: "guest-42".to_string(),
                field_name: DEFAULT_FIELD_NAME.to_string(),
                mime_type: DEFAULT_MIME_TYPE.to_string(),
            },
        )
    }

    fn request(tmp: &TempDir) -> TransferRequest {
        let payload = tmp.path().join("abc.gz");
        std::fs::write(&payload, b"PAYLOAD-BYTES").unwrap();
        TransferRequest {
            payload,
            metadata: UploadMetadata {
                asset_id: "abc".to_string(),
                filename: "shot.png".to_string(),
                user_id: "user-7".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn posts_form_with_fixed_field_and_auth_header() {
        let tmp = TempDir::new().unwrap();
        let (base_url, server) = serve_once(201, "{\"ok\":true}").await;

        let response = transport(&base_url).send(&request(&tmp)).await.unwrap();
        assert_eq!(response.status, 201);
        assert!(response.is_success());

        let raw = server.await.unwrap();
        let lower = raw.to_lowercase();
        assert!(raw.starts_with("POST /api/screenshots HTTP/1.1"));
        assert!(lower.contains("x-guest-id: guest-42"));
        assert!(lower.contains("content-type: multipart/form-data"));
        assert!(raw.contains("name=\"screenshots\"; filename=\"shot.png\""));
        assert!(lower.contains("content-type: application/gzip"));
        assert!(raw.contains("name=\"userId\"\r\n\r\nuser-7"));
        assert!(raw.contains("PAYLOAD-BYTES"));
    }

    #[tokio::test]
    async fn server_error_comes_back_as_response() {
        let tmp = TempDir::new().unwrap();
        let (base_url, server) = serve_once(500, "disk full").await;

        let response = transport(&base_url).send(&request(&tmp)).await.unwrap();
        server.await.unwrap();

        assert_eq!(response.status, 500);
        assert_eq!(
            response.into_outcome().unwrap_err().to_string(),
            "server responded 500: disk full"
        );
    }

    #[tokio::test]
    async fn bad_mime_type_is_not_a_network_error() {
        let tmp = TempDir::new().unwrap();
        let mut transport = transport("http://127.0.0.1:9");
        transport.endpoint.mime_type = "gzip".to_string();

        let err = transport.send(&request(&tmp)).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidRequest(_)));
        assert!(err.to_string().contains("invalid MIME type gzip"));
    }

    #[tokio::test]
    async fn missing_payload_fails_before_sending() {
        let tmp = TempDir::new().unwrap();
        let mut req = request(&tmp);
        req.payload = tmp.path().join("missing.gz");

        let err = transport("http://127.0.0.1:9").send(&req).await.unwrap_err();
        assert!(matches!(err, TransportError::Payload { .. }));
    }
}
