//! Distribution task errors

use crate::data::StoreError;
use crate::network::TransportError;
use crate::resource::ResourceError;

/// Errors that can occur while starting or driving a distribution task
#[derive(Debug)]
pub enum TaskError {
    /// Failed to start the task
    StartFailed(String),
    /// Chunk store error
    Store(StoreError),
    /// Network error
    Network(String),
    /// Resource error
    Resource(ResourceError),
    /// Task is not running
    NotRunning,
    /// Invalid input provided
    InvalidInput(String),
    /// IO error
    Io(String),
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::StartFailed(e) => write!(f, "failed to start task: {}", e),
            TaskError::Store(e) => write!(f, "store error: {}", e),
            TaskError::Network(e) => write!(f, "network error: {}", e),
            TaskError::Resource(e) => write!(f, "resource error: {}", e),
            TaskError::NotRunning => write!(f, "task is not running"),
            TaskError::InvalidInput(e) => write!(f, "invalid input: {}", e),
            TaskError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for TaskError {}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        TaskError::Io(e.to_string())
    }
}

impl From<StoreError> for TaskError {
    fn from(e: StoreError) -> Self {
        TaskError::Store(e)
    }
}

impl From<TransportError> for TaskError {
    fn from(e: TransportError) -> Self {
        TaskError::Network(e.to_string())
    }
}

impl From<ResourceError> for TaskError {
    fn from(e: ResourceError) -> Self {
        TaskError::Resource(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_display() {
        let err = TaskError::NotRunning;
        assert_eq!(err.to_string(), "task is not running");

        let err = TaskError::Store(StoreError::Database("locked".to_string()));
        assert_eq!(err.to_string(), "store error: database error: locked");

        let err = TaskError::InvalidInput("/".to_string());
        assert_eq!(err.to_string(), "invalid input: /");
    }

    #[test]
    fn test_task_error_is_error_trait() {
        let err: Box<dyn std::error::Error> = Box::new(TaskError::NotRunning);
        assert!(!err.to_string().is_empty());
    }
}
