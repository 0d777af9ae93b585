use agent_client::AgentError;
use std::fmt;

/// gRPC-style status code every `ShimError` maps to at the RPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    Unimplemented,
    Unavailable,
    Internal,
}

#[derive(Debug)]
pub enum ShimError {
    Validation { field: String, message: String },
    NotFound { resource: String },
    Conflict { resource: String },
    Unimplemented { what: String },
    Agent(AgentError),
    Internal { message: String },
}

impl ShimError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ShimError::Validation { field: field.into(), message: message.into() }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        ShimError::NotFound { resource: resource.into() }
    }

    pub fn conflict(resource: impl Into<String>) -> Self {
        ShimError::Conflict { resource: resource.into() }
    }

    pub fn unimplemented(what: impl Into<String>) -> Self {
        ShimError::Unimplemented { what: what.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ShimError::Internal { message: message.into() }
    }

    /// The single place that decides the RPC status code for an error.
    /// Handlers must go through this rather than hand-mapping strings.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ShimError::Validation { .. } => StatusCode::InvalidArgument,
            ShimError::NotFound { .. } => StatusCode::NotFound,
            ShimError::Conflict { .. } => StatusCode::AlreadyExists,
            ShimError::Unimplemented { .. } => StatusCode::Unimplemented,
            ShimError::Internal { .. } => StatusCode::Internal,
            ShimError::Agent(e) => match e.code {
                shim_protocol::AgentStatusCode::NotFound => StatusCode::NotFound,
                shim_protocol::AgentStatusCode::AlreadyExists => StatusCode::AlreadyExists,
                shim_protocol::AgentStatusCode::Unimplemented => StatusCode::Unimplemented,
                shim_protocol::AgentStatusCode::Unavailable => StatusCode::Unavailable,
                shim_protocol::AgentStatusCode::InvalidArgument => StatusCode::InvalidArgument,
                shim_protocol::AgentStatusCode::Internal => StatusCode::Internal,
            },
        }
    }
}

impl fmt::Display for ShimError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ShimError::Validation { field, message } => {
                write!(f, "validation error for '{field}': {message}")
            }
            ShimError::NotFound { resource } => write!(f, "not found: {resource}"),
            ShimError::Conflict { resource } => write!(f, "already exists: {resource}"),
            ShimError::Unimplemented { what } => write!(f, "unimplemented: {what}"),
            ShimError::Agent(e) => write!(f, "{e}"),
            ShimError::Internal { message } => write!(f, "internal error: {message}"),
        }
    }
}

impl std::error::Error for ShimError {}

impl From<AgentError> for ShimError {
    fn from(e: AgentError) -> Self {
        ShimError::Agent(e)
    }
}

pub type Result<T> = std::result::Result<T, ShimError>;
