use thiserror::Error;

/// Errors from a single wire client call. The pool folds all of these into
/// "failure" for scheduling; the variant only matters for logging.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Request timed out after {secs}s")]
    Timeout { secs: u64 },
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("No usable LLM endpoints configured (set an api_key for at least one)")]
    NoEndpoints,

    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("Invalid priority order: {0}")]
    InvalidPriorityOrder(String),

    #[error("All LLM endpoints failed: {last}")]
    AllEndpointsFailed { last: String },
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Guardrail failed after {violations} violations")]
    GuardExhausted { violations: u32 },

    #[error("Turn hit the iteration limit ({0}) without a final response")]
    MaxIterations(u32),

    #[error("Tool error: {0}")]
    Tool(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
