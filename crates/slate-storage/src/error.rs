use slate_agent_client::AgentClientError;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The command never reached the agent or no response arrived.
    #[error("transport failure: {0}")]
    Transport(#[from] AgentClientError),
    /// The agent answered with success=false and an error string.
    #[error("{0}")]
    Agent(String),
    /// The image cache could not be read, written, or verified.
    #[error("image cache error: {0}")]
    Cache(String),
    #[error("{0}")]
    Internal(String),
}
