pub mod client;
pub mod error;
pub mod fake;
pub mod transport;

pub use client::{AgentClient, EnterResult, ProcessIo, RpcAgentClient};
pub use error::{AgentError, Result};
pub use transport::AgentEndpoint;
