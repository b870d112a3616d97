//! Typed errors for the JIRA and Lark connectors.

use thiserror::Error;

/// Errors surfaced by the REST clients.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Could not obtain or refresh credentials.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The HTTP exchange itself failed (transport, timeout, TLS).
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success HTTP status.
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// A Lark `{code, msg, data}` envelope with a non-zero code.
    #[error("API error {code}: {msg}")]
    Api { code: i64, msg: String },

    /// The response body did not have the expected shape.
    #[error("unexpected response shape: {0}")]
    BadResponse(String),

    /// A paged fetch finished with gaps; carries the failed page offsets so
    /// the caller can abort without persisting partial state.
    #[error("incomplete fetch: expected {expected}, collected {actual}, failed offsets {failed_offsets:?}")]
    DataIncomplete {
        expected: usize,
        actual: usize,
        failed_offsets: Vec<usize>,
    },
}
