use thiserror::Error;

/// Failures the commands need to tell apart. Everything else travels as a
/// plain `anyhow` chain.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    #[error("{method} {url} failed with status {status}: {body}")]
    Http {
        method: &'static str,
        url: String,
        status: u16,
        body: String,
    },

    #[error("{tool} failed: {message}")]
    Tool { tool: String, message: String },
}

impl PipelineError {
    pub fn missing(what: impl Into<String>) -> Self {
        Self::MissingConfig(what.into())
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// True when the chain carries an HTTP 404 from the backend.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<PipelineError>())
        .any(|e| e.status() == Some(404))
}

/// Response bodies are only echoed as a short excerpt.
pub fn excerpt(body: &str) -> String {
    const LIMIT: usize = 500;
    if body.chars().count() <= LIMIT {
        body.trim().to_string()
    } else {
        let cut: String = body.chars().take(LIMIT).collect();
        format!("{}...", cut.trim_end())
    }
}
