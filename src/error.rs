use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum EtlError {
    #[error("connection reset by archive: {0}")]
    ConnectionReset(String),

    #[error("gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("archive request failed: {0}")]
    ArchiveHttp(String),

    #[error("archive returned status {status}: {message}")]
    ArchiveStatus { status: u16, message: String },

    #[error("archive could not complete request: {0}")]
    ArchiveRequestFailed(String),

    #[error("last hour written '{hour}' is not 23 (last timestamp {timestamp}); check on the data")]
    #[diagnostic(help("the store ends mid-day; a previous write was interrupted or corrupted"))]
    NotDayComplete { hour: u32, timestamp: String },

    #[error("start_period={start} is not consecutive with the last timestamp={last}")]
    NonConsecutivePeriod { start: String, last: String },

    #[error("coordinate '{coordinate}' differs between '{left}' and '{right}'")]
    CoordinateMismatch {
        coordinate: String,
        left: String,
        right: String,
    },

    #[error("variable '{0}' appears in several inputs with different values")]
    ConflictingVariable(String),

    #[error("time axis for {period} is not the expected hourly sequence: {reason}")]
    UnexpectedTimeAxis { period: String, reason: String },

    #[error("dataset does not match the store layout: {0}")]
    SchemaMismatch(String),

    #[error("no attribute record for variable '{0}'")]
    MissingAttributes(String),

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("invalid period: {0}")]
    InvalidPeriod(String),

    #[error("invalid kind: {0}")]
    InvalidKind(String),

    #[error("unsupported storage protocol: {0}")]
    InvalidProtocol(String),

    #[error("invalid storage option: {0}")]
    InvalidStorageOption(String),

    #[error("invalid extra field '{0}', expected key=value")]
    InvalidExtraField(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("no store found at {0}")]
    StoreNotFound(String),

    #[error("invalid store metadata: {0}")]
    Metadata(String),

    #[error("zarr array error: {0}")]
    Zarr(String),

    #[error("netCDF error: {0}")]
    Netcdf(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("dataset error: {0}")]
    Dataset(String),
}

impl EtlError {
    /// Errors worth another attempt against the archive.
    pub fn is_transient(&self) -> bool {
        matches!(self, EtlError::ConnectionReset(_))
    }

    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            EtlError::NotDayComplete { .. }
                | EtlError::NonConsecutivePeriod { .. }
                | EtlError::CoordinateMismatch { .. }
                | EtlError::ConflictingVariable(_)
                | EtlError::UnexpectedTimeAxis { .. }
                | EtlError::SchemaMismatch(_)
        )
    }

    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EtlError::MissingAttributes(_)
                | EtlError::InvalidCredential(_)
                | EtlError::InvalidPeriod(_)
                | EtlError::InvalidKind(_)
                | EtlError::InvalidProtocol(_)
                | EtlError::InvalidStorageOption(_)
                | EtlError::InvalidExtraField(_)
                | EtlError::ConfigRead(_)
                | EtlError::ConfigParse(_)
        )
    }
}
