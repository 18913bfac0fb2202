/// Errors raised while parsing messages and envelopes.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The text is not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The JSON value has the wrong shape.
    #[error("expected a JSON object for {0}")]
    NotAnObject(&'static str),

    /// A required field is missing.
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    /// A field is present but has an unusable value.
    #[error("invalid value for field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// The envelope carries neither a message nor a (un)subscribe command.
    #[error("envelope carries no message, subscribe or unsubscribe")]
    EmptyEnvelope,
}

pub type Result<T> = std::result::Result<T, WireError>;
