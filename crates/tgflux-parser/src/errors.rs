use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("channel file is empty")]
    EmptyFile,

    #[error("channel file is not valid JSON: {source}")]
    InvalidJson {
        #[source]
        source: serde_json::Error,
    },

    #[error("channel file must contain a JSON array of messages, found {found}")]
    NotAnArray { found: &'static str },

    #[error("invalid channel identifier '{identifier}': {reason}")]
    InvalidChannel { identifier: String, reason: String },

    #[error("cannot derive media key from '{path}': {reason}")]
    MediaPath { path: String, reason: String },

    #[error("desktop export is invalid: {source}")]
    InvalidExport {
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
