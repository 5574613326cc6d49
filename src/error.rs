use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Table,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Table => write!(f, "table"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlErrorCode {
    Io,
    Encode,
    Decode,
    Validation,
    InvalidConfig,
    TtlConfig,
    TableAlreadyExists,
    TableNotFound,
    NotFound,
    DuplicatePrimaryKey,
    UnknownColumn,
    TypeMismatch,
    NotNullViolation,
    LockWaitTimeout,
    LockContention,
    TransactionState,
    ReplicationDivergence,
    ClockSkew,
    IntegrityError,
    Shutdown,
}

impl TtlErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            TtlErrorCode::Io => "io",
            TtlErrorCode::Encode => "encode",
            TtlErrorCode::Decode => "decode",
            TtlErrorCode::Validation => "validation",
            TtlErrorCode::InvalidConfig => "invalid_config",
            TtlErrorCode::TtlConfig => "ttl_config",
            TtlErrorCode::TableAlreadyExists => "table_already_exists",
            TtlErrorCode::TableNotFound => "table_not_found",
            TtlErrorCode::NotFound => "not_found",
            TtlErrorCode::DuplicatePrimaryKey => "duplicate_primary_key",
            TtlErrorCode::UnknownColumn => "unknown_column",
            TtlErrorCode::TypeMismatch => "type_mismatch",
            TtlErrorCode::NotNullViolation => "not_null_violation",
            TtlErrorCode::LockWaitTimeout => "lock_wait_timeout",
            TtlErrorCode::LockContention => "lock_contention",
            TtlErrorCode::TransactionState => "transaction_state",
            TtlErrorCode::ReplicationDivergence => "replication_divergence",
            TtlErrorCode::ClockSkew => "clock_skew",
            TtlErrorCode::IntegrityError => "integrity_error",
            TtlErrorCode::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Error)]
pub enum TtlError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    /// Malformed TTL column or duration at table creation. The DDL is rejected.
    #[error("ttl config error on table '{table}': {message}")]
    Config { table: String, message: String },
    #[error("{resource_type} '{resource_id}' already exists")]
    AlreadyExists {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("{resource_type} '{resource_id}' not found")]
    NotFound {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("duplicate primary key in table '{table}': {key}")]
    DuplicatePK { table: String, key: String },
    #[error("unknown column '{column}' in table '{table}'")]
    UnknownColumn { table: String, column: String },
    #[error(
        "type mismatch: column '{column}' in table '{table}' expected {expected}, got {actual}"
    )]
    TypeMismatch {
        table: String,
        column: String,
        expected: String,
        actual: String,
    },
    #[error("NOT NULL violation: column '{column}' in table '{table}'")]
    NotNullViolation { table: String, column: String },
    #[error("lock wait timeout exceeded on table '{table}'")]
    LockWaitTimeout { table: String },
    /// Reaper-only: the row is locked by a foreground transaction. Never
    /// surfaced to statement callers.
    #[error("row in table '{table}' is locked; deferred")]
    LockContention { table: String },
    #[error("transaction state error: {0}")]
    TransactionState(String),
    #[error("replication divergence on table '{table}': {message}")]
    ReplicationDivergence { table: String, message: String },
    #[error("clock skew of {skew_ms}ms exceeds tolerance of {tolerance_ms}ms")]
    ClockSkew { skew_ms: u64, tolerance_ms: u64 },
    #[error("integrity error: {message}")]
    IntegrityError { message: String },
    #[error("engine is shutting down")]
    Shutdown,
}

impl TtlError {
    pub fn code(&self) -> TtlErrorCode {
        match self {
            TtlError::Io(_) => TtlErrorCode::Io,
            TtlError::Encode(_) => TtlErrorCode::Encode,
            TtlError::Decode(_) => TtlErrorCode::Decode,
            TtlError::Validation(_) => TtlErrorCode::Validation,
            TtlError::InvalidConfig { .. } => TtlErrorCode::InvalidConfig,
            TtlError::Config { .. } => TtlErrorCode::TtlConfig,
            TtlError::AlreadyExists { resource_type, .. } => match resource_type {
                ResourceType::Table => TtlErrorCode::TableAlreadyExists,
                _ => TtlErrorCode::Validation,
            },
            TtlError::NotFound { resource_type, .. } => match resource_type {
                ResourceType::Table => TtlErrorCode::TableNotFound,
                _ => TtlErrorCode::NotFound,
            },
            TtlError::DuplicatePK { .. } => TtlErrorCode::DuplicatePrimaryKey,
            TtlError::UnknownColumn { .. } => TtlErrorCode::UnknownColumn,
            TtlError::TypeMismatch { .. } => TtlErrorCode::TypeMismatch,
            TtlError::NotNullViolation { .. } => TtlErrorCode::NotNullViolation,
            TtlError::LockWaitTimeout { .. } => TtlErrorCode::LockWaitTimeout,
            TtlError::LockContention { .. } => TtlErrorCode::LockContention,
            TtlError::TransactionState(_) => TtlErrorCode::TransactionState,
            TtlError::ReplicationDivergence { .. } => TtlErrorCode::ReplicationDivergence,
            TtlError::ClockSkew { .. } => TtlErrorCode::ClockSkew,
            TtlError::IntegrityError { .. } => TtlErrorCode::IntegrityError,
            TtlError::Shutdown => TtlErrorCode::Shutdown,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub(crate) fn table_not_found(table: &str) -> Self {
        TtlError::NotFound {
            resource_type: ResourceType::Table,
            resource_id: table.to_string(),
        }
    }

    pub(crate) fn ttl_config(table: &str, message: impl Into<String>) -> Self {
        TtlError::Config {
            table: table.to_string(),
            message: message.into(),
        }
    }
}
