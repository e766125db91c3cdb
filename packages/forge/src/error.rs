//! Typed failure categories at the orchestrator boundary.
//!
//! Inside modules we use `color_eyre` context chains as usual; the build
//! environment and the request surface wrap those reports into an [`Error`]
//! carrying a [`Kind`] (which drives HTTP status selection) and, for failures
//! produced by subprocesses, an excerpt of the build log.

use color_eyre::Report;
use derive_more::Display;

use crate::log::BuildLog;

/// The category of a failure.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum Kind {
    /// Missing or malformed request fields, bad uid bounds, bad platform,
    /// unsupported deploy cardinality.
    #[display("validation")]
    Validation,

    /// Missing or wrong credentials.
    #[display("auth")]
    Auth,

    /// Fetch, copy, refresh, or checkout failure.
    #[display("provisioning")]
    Provisioning,

    /// Lint, test, or cross-compile failure.
    #[display("verification")]
    Verification,

    /// Compile or archive failure.
    #[display("build")]
    Build,

    /// Snapshot or rollback failure; the master cache may be inconsistent.
    #[display("integrity")]
    Integrity,

    /// I/O, signing, or streaming failure.
    #[display("internal")]
    Internal,
}

/// A categorized failure, optionally carrying the build log.
#[derive(Debug, Display)]
#[display("{kind}: {report}")]
pub struct Error {
    kind: Kind,
    report: Report,
    log: Option<String>,
}

impl Error {
    pub fn new(kind: Kind, report: Report) -> Self {
        Self {
            kind,
            report,
            log: None,
        }
    }

    /// Attach a snapshot of the build log to the failure.
    pub fn logged(kind: Kind, report: Report, log: &BuildLog) -> Self {
        Self {
            kind,
            report,
            log: Some(log.snapshot()),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(Kind::Validation, Report::msg(message.into()))
    }

    pub fn internal(report: Report) -> Self {
        Self::new(Kind::Internal, report)
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Human-readable failure message, including the context chain.
    pub fn message(&self) -> String {
        self.report
            .chain()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(": ")
    }

    pub fn log(&self) -> Option<&str> {
        self.log.as_deref()
    }
}

impl std::error::Error for Error {}

/// Wraps module-level reports into categorized errors at stage boundaries.
pub trait Categorize<T> {
    fn categorize(self, kind: Kind) -> Result<T, Error>;
    fn categorize_logged(self, kind: Kind, log: &BuildLog) -> Result<T, Error>;
}

impl<T> Categorize<T> for color_eyre::Result<T> {
    fn categorize(self, kind: Kind) -> Result<T, Error> {
        self.map_err(|report| Error::new(kind, report))
    }

    fn categorize_logged(self, kind: Kind, log: &BuildLog) -> Result<T, Error> {
        self.map_err(|report| Error::logged(kind, report, log))
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::eyre::{Context, eyre};

    use super::*;

    #[test]
    fn message_includes_context_chain() {
        let report = Err::<(), _>(eyre!("exit status 1"))
            .context("run tests")
            .unwrap_err();
        let error = Error::new(Kind::Verification, report);
        assert_eq!(error.message(), "run tests: exit status 1");
        assert_eq!(error.kind(), Kind::Verification);
        assert!(error.log().is_none());
    }

    #[test]
    fn logged_snapshots_the_buffer() {
        let log = BuildLog::default();
        log.line("go test ./...");
        let error = Error::logged(Kind::Verification, eyre!("boom"), &log);
        assert_eq!(error.log(), Some("go test ./...\n"));
    }
}
