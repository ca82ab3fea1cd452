use thiserror::Error;

/// Failures surfaced by the storage collaborator.
///
/// Write failures are contained by the collector that issued the write;
/// anything returned from an aggregation pass is fatal to the run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage node {0} is unavailable")]
    NodeUnavailable(String),
    #[error("write rejected: {0}")]
    WriteRejected(String),
    #[error("aggregation failed: {0}")]
    AggregationFailed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TimeSliceError {
    #[error("unknown interval type `{0}` (expected minutes or seconds)")]
    UnknownIntervalType(String),
}
