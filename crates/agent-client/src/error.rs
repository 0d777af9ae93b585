use shim_protocol::AgentStatusCode;
use std::fmt;

/// Failure talking to the in-guest agent. Carries the gRPC-style status
/// code the agent reported (or that the transport inferred) so callers
/// can branch without string-matching the message.
#[derive(Debug)]
pub struct AgentError {
    pub code: AgentStatusCode,
    pub message: String,
    pub context: Option<String>,
}

impl AgentError {
    pub fn new(code: AgentStatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(AgentStatusCode::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(AgentStatusCode::Unavailable, message)
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "agent error ({:?}): {}", self.code, self.message)?;
        if let Some(ctx) = &self.context {
            write!(f, " (context: {})", ctx)?;
        }
        Ok(())
    }
}

impl std::error::Error for AgentError {}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::new(AgentStatusCode::Unavailable, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
