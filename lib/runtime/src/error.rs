//! Error types for runtime invocations.

use std::fmt;

/// A single parameter validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterError {
    /// The offending parameter name.
    pub parameter: String,
    /// What is wrong with it.
    pub message: String,
}

impl ParameterError {
    /// Creates a parameter error.
    #[must_use]
    pub fn new(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            parameter: parameter.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ParameterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parameter '{}': {}", self.parameter, self.message)
    }
}

/// Errors from agent or tool invocations.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// No agent registered under the given id.
    AgentNotFound { agent_id: String },
    /// No tool registered under the given id.
    ToolNotFound { tool_id: String },
    /// The backend ran but failed.
    InvocationFailed { message: String },
    /// Tool parameters failed validation.
    InvalidParameters { errors: Vec<ParameterError> },
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AgentNotFound { agent_id } => write!(f, "agent not found: {agent_id}"),
            Self::ToolNotFound { tool_id } => write!(f, "tool not found: {tool_id}"),
            Self::InvocationFailed { message } => write!(f, "invocation failed: {message}"),
            Self::InvalidParameters { errors } => {
                write!(f, "invalid parameters: ")?;
                for (i, error) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{error}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_parameters_display_joins_errors() {
        let err = RuntimeError::InvalidParameters {
            errors: vec![
                ParameterError::new("url", "is required"),
                ParameterError::new("retries", "expected number"),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("'url': is required"));
        assert!(text.contains("'retries': expected number"));
    }
}
