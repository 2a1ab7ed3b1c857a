use thiserror::Error;

/// Why a string could not be read back as a typed id.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("id is empty")]
    Empty,

    #[error("id must look like '{expected}_<ulid>', got prefix '{found}'")]
    InvalidPrefix {
        expected: &'static str,
        found: String,
    },

    #[error("id has no '_' between prefix and ulid")]
    MissingSeparator,

    #[error("id suffix is not a valid ulid: {0}")]
    InvalidUlid(String),
}

impl IdError {
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
