use thiserror::Error;

/// Failures talking to the Prismatic GraphQL API.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("missing configuration: {0}")]
    Configuration(String),

    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },

    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("{0}")]
    Graphql(String),

    #[error("unexpected response shape: {0}")]
    Malformed(String),
}

/// Failures negotiating a public tunnel for the callback server.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel provider '{provider}' is not available")]
    Unavailable { provider: String },

    #[error("failed to start '{provider}': {reason}")]
    Spawn { provider: String, reason: String },

    #[error("'{provider}' did not report a public url within {seconds}s")]
    Timeout { provider: String, seconds: u64 },

    #[error("'{provider}' exited before reporting a public url")]
    Exited { provider: String },

    #[error("failed to stop '{provider}': {reason}")]
    Disconnect { provider: String, reason: String },
}

/// Errors returned to callers that trigger test runs.
#[derive(Debug, Error)]
pub enum TestRunError {
    #[error("missing configuration: {0}")]
    Configuration(String),

    #[error("test-run orchestrator is no longer running")]
    Closed,
}
