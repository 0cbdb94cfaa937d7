use thiserror::Error;

/// Longest server body kept in a stored diagnostic.
const MAX_BODY_DIAGNOSTIC: usize = 512;

/// Failure of a single transfer attempt.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("server responded {status}: {}", body_or_placeholder(.body))]
    Rejected { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("could not build request: {0}")]
    InvalidRequest(String),

    #[error("failed to read payload {path}: {source}")]
    Payload {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transfer task ended without reporting a result")]
    Abandoned,
}

impl TransportError {
    pub fn rejected(status: u16, body: &str) -> Self {
        let mut body = body.trim().to_string();
        if body.len() > MAX_BODY_DIAGNOSTIC {
            let mut cut = MAX_BODY_DIAGNOSTIC;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
            body.push('…');
        }
        TransportError::Rejected { status, body }
    }
}

fn body_or_placeholder(body: &str) -> &str {
    if body.is_empty() {
        "empty response"
    } else {
        body
    }
}

/// Per-asset failure. The `Display` text is what lands in `UploadRecord.error`.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("could not resolve asset: {0}")]
    Resolve(String),

    #[error("compression failed: {0}")]
    Compress(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("batch failed: {0}")]
    Batch(String),
}

/// Run-level failure that aborts a run before any record is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunFailure {
    #[error("source library access not granted: {0}")]
    PermissionDenied(String),
}
