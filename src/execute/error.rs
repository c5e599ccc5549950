/// Failure of a single command or record write. A worksite conflict is not
/// an error; it is reported as [`super::executor::Outcome::Conflict`].
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    /// Missing or malformed required field, unknown enum value.
    #[error("{0}")]
    InvalidRequest(String),

    /// The address hint or worksite id matched no stored worksite.
    #[error("Baustelle nicht gefunden: {0}")]
    WorksiteNotFound(String),

    /// The backing store rejected an insert. Sub-resources created earlier in
    /// the same command have already been removed.
    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ExecuteError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecuteError::InvalidRequest(_) => "invalid_request",
            ExecuteError::WorksiteNotFound(_) => "worksite_not_found",
            ExecuteError::WriteFailed(_) => "write_failed",
            ExecuteError::Internal(_) => "internal",
        }
    }

    pub fn write_failed(err: anyhow::Error) -> Self {
        ExecuteError::WriteFailed(format!("{err:#}"))
    }
}
