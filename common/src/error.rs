use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("schedule storage i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("remote store returned error {code}: {message}")]
    Remote { code: i32, message: String },
    #[error("remote store did not answer within {0} ms")]
    Timeout(u32),
    #[error("malformed remote payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("expected 7 fields, found {0}")]
    FieldCount(usize),
    #[error("invalid {field}: `{value}`")]
    Field { field: &'static str, value: String },
    #[error("invalid task arguments: `{0}`")]
    Args(String),
}

impl RecordError {
    pub(crate) fn field(field: &'static str, value: &str) -> Self {
        Self::Field {
            field,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("task limit of {0} reached")]
    Full(usize),
    #[error("task {0} not found")]
    NotFound(u8),
    #[error("task id {0} is already in use")]
    DuplicateId(u8),
    #[error(transparent)]
    Store(#[from] StoreError),
}
