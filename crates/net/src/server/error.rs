use crate::net::NetworkError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("subsystem {name} failed: {message}")]
    Subsystem { name: String, message: String },
    #[error("fault while shutting down: {0}")]
    DoubleFault(String),
}

impl ServerError {
    /// Whether the loop must stop as crashed instead of shutting down in order.
    pub fn is_fatal(&self) -> bool {
        match self {
            ServerError::Network(e) => e.is_fatal(),
            ServerError::Subsystem { .. } => false,
            ServerError::DoubleFault(_) => true,
        }
    }
}
