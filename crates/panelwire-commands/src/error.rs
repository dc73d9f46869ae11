//! Error types for the request cycle.

/// A mandatory argument was missing when a request was about to be sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Missing mandatory parameter {parameter} in request")]
pub struct MissingParameter {
    /// Symbolic name of the missing parameter
    pub parameter: &'static str,
}

impl MissingParameter {
    /// Build the error for a parameter.
    pub fn new(parameter: &dyn crate::command::Parameter) -> Self {
        Self {
            parameter: parameter.name(),
        }
    }
}

/// Failures of one request cycle.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    MissingParameter(#[from] MissingParameter),

    #[error("Failed HTTP post ({0})")]
    HttpStatus(u16),

    #[error("ERROR({code}) - {message}")]
    ErrorResponse { code: String, message: String },

    #[error("Maximum number of attempts reached ({0})")]
    MaxAttempts(u32),

    #[error("Request interrupted")]
    Interrupted,

    #[error(transparent)]
    Transport(#[from] crate::transport::TransportError),
}

impl RequestError {
    /// Whether the failure happened before anything was sent.
    pub fn is_vetoed(&self) -> bool {
        matches!(self, RequestError::MissingParameter(_))
    }
}

/// Lookup failures on a response body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResponseError {
    #[error("Missing expected element {0} in response")]
    MissingElement(&'static str),
}
