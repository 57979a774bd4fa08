//! Hand-rolled error kinds for the profiler core.
//!
//! Recoverable per-record problems are logged and dropped inside the ingest
//! adapter; everything here is the set of kinds that can legitimately
//! bubble out of the library to the binary's `main`.

use std::fmt;

#[derive(Debug)]
pub enum ProfilerError {
    /// A configuration value failed validation (e.g. threshold out of 0..100).
    Config(String),
    /// Allocation-site resource exhaustion.
    ResourceExhausted(&'static str),
    /// A buffer mutex was found poisoned by a panicking thread.
    SyncAnomaly(String),
    /// Writing output (file or stdout) failed.
    OutputWrite(std::io::Error),
    /// Reading the input stream failed for a reason other than clean EOF.
    Io(std::io::Error),
}

impl fmt::Display for ProfilerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfilerError::Config(msg) => write!(f, "invalid configuration: {msg}"),
            ProfilerError::ResourceExhausted(site) => {
                write!(f, "resource exhaustion at {site}")
            }
            ProfilerError::SyncAnomaly(msg) => write!(f, "synchronization anomaly: {msg}"),
            ProfilerError::OutputWrite(e) => write!(f, "output write failed: {e}"),
            ProfilerError::Io(e) => write!(f, "input read failed: {e}"),
        }
    }
}

impl std::error::Error for ProfilerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProfilerError::OutputWrite(e) | ProfilerError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProfilerError {
    fn from(e: std::io::Error) -> Self {
        ProfilerError::Io(e)
    }
}

impl<T> From<std::sync::PoisonError<T>> for ProfilerError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        ProfilerError::SyncAnomaly(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProfilerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let e = ProfilerError::Config("threshold must be 0..100".to_string());
        assert_eq!(
            e.to_string(),
            "invalid configuration: threshold must be 0..100"
        );
    }

    #[test]
    fn io_error_wraps_source() {
        use std::error::Error;
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let e: ProfilerError = io.into();
        assert!(e.source().is_some());
    }

    #[test]
    fn resource_exhausted_display() {
        let e = ProfilerError::ResourceExhausted("odflow_alloc");
        assert_eq!(e.to_string(), "resource exhaustion at odflow_alloc");
    }
}
