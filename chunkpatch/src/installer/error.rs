//! Installer-level error state.
//!
//! Any stage or component may report an error; the first one reported wins and
//! is what the caller sees, except that a cancellation replaces a failure. Reporting an error also runs the registered
//! handlers, which the installer uses to abort every running component.

use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;

/// Category of an installation failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum InstallErrorKind {
    #[default]
    NoError,
    InitializationError,
    DownloadError,
    FileConstructionFail,
    PathLengthExceeded,
    MoveFileToInstall,
    BuildVerifyFail,
    PrerequisiteError,
    UserCanceled,
    ApplicationClosing,
}

impl InstallErrorKind {
    /// Prefix of the error codes of this kind.
    pub fn code_prefix(&self) -> &'static str {
        match self {
            Self::NoError => "OK",
            Self::InitializationError => "IN",
            Self::DownloadError => "DL",
            Self::FileConstructionFail => "FC",
            Self::PathLengthExceeded => "PL",
            Self::MoveFileToInstall => "MF",
            Self::BuildVerifyFail => "BV",
            Self::PrerequisiteError => "PQ",
            Self::UserCanceled => "UC",
            Self::ApplicationClosing => "AC",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NoError => "NoError",
            Self::InitializationError => "InitializationError",
            Self::DownloadError => "DownloadError",
            Self::FileConstructionFail => "FileConstructionFail",
            Self::PathLengthExceeded => "PathLengthExceeded",
            Self::MoveFileToInstall => "MoveFileToInstall",
            Self::BuildVerifyFail => "BuildVerifyFail",
            Self::PrerequisiteError => "PrerequisiteError",
            Self::UserCanceled => "UserCanceled",
            Self::ApplicationClosing => "ApplicationClosing",
        }
    }

    /// Whether another installation attempt may fix this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::FileConstructionFail | Self::MoveFileToInstall | Self::BuildVerifyFail
        )
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::UserCanceled | Self::ApplicationClosing)
    }
}

impl fmt::Display for InstallErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A reported error with its stable code and text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallError {
    pub kind: InstallErrorKind,
    /// `<prefix>-<reason>`, e.g. `IN-MissingInstallDirectory`.
    pub code: String,
    pub text: String,
}

type ErrorHandler = Box<dyn Fn(&InstallError) + Send + Sync>;

/// First-error-wins holder shared by every installer component.
#[derive(Default)]
pub struct InstallerError {
    error: Mutex<Option<InstallError>>,
    handlers: Mutex<Vec<ErrorHandler>>,
}

impl InstallerError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report an error. Returns `false` if an error was already set.
    pub fn set_error(&self, kind: InstallErrorKind, reason: &str, text: impl Into<String>) -> bool {
        if kind == InstallErrorKind::NoError {
            return false;
        }
        self.store(kind, reason, text.into(), |_| false)
    }

    /// Report a cancellation. It replaces any stored error that is not
    /// itself a cancellation, so a failed attempt cannot hide it.
    pub fn set_cancellation(&self, kind: InstallErrorKind, text: impl Into<String>) -> bool {
        if !kind.is_cancellation() {
            return false;
        }
        self.store(kind, kind.name(), text.into(), |current| {
            !current.kind.is_cancellation()
        })
    }

    fn store(
        &self,
        kind: InstallErrorKind,
        reason: &str,
        text: String,
        replaces: impl Fn(&InstallError) -> bool,
    ) -> bool {
        let error = InstallError {
            kind,
            code: format!("{}-{}", kind.code_prefix(), reason),
            text,
        };

        {
            let mut current = self.error.lock();
            if let Some(existing) = current.as_ref() {
                if !replaces(existing) {
                    tracing::debug!(code = %error.code, "Ignoring error reported after the first");
                    return false;
                }
                tracing::debug!(replaced = %existing.code, code = %error.code, "Error replaced");
            }
            if kind.is_cancellation() {
                tracing::info!(code = %error.code, "Installation cancelled");
            } else {
                tracing::error!(code = %error.code, text = %error.text, "Installation error");
            }
            *current = Some(error.clone());
        }

        for handler in self.handlers.lock().iter() {
            handler(&error);
        }
        true
    }

    /// Run `handler` whenever an error is stored.
    pub fn register_handler(&self, handler: impl Fn(&InstallError) + Send + Sync + 'static) {
        self.handlers.lock().push(Box::new(handler));
    }

    pub fn error(&self) -> Option<InstallError> {
        self.error.lock().clone()
    }

    pub fn kind(&self) -> InstallErrorKind {
        self.error.lock().as_ref().map_or(InstallErrorKind::NoError, |e| e.kind)
    }

    pub fn code(&self) -> String {
        self.error
            .lock()
            .as_ref()
            .map_or_else(|| String::from("OK"), |e| e.code.clone())
    }

    pub fn text(&self) -> String {
        self.error
            .lock()
            .as_ref()
            .map(|e| e.text.clone())
            .unwrap_or_default()
    }

    /// True for any error other than a cancellation.
    pub fn has_fatal_error(&self) -> bool {
        let kind = self.kind();
        kind != InstallErrorKind::NoError && !kind.is_cancellation()
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind().is_cancellation()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Clear the error before a retry. Cancellations stick.
    pub fn reset(&self) {
        let mut current = self.error.lock();
        if current.as_ref().is_some_and(|e| !e.kind.is_cancellation()) {
            *current = None;
        }
    }
}

impl fmt::Debug for InstallerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallerError")
            .field("error", &*self.error.lock())
            .field("handlers", &self.handlers.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_first_error_wins() {
        let errors = InstallerError::new();
        assert!(errors.set_error(InstallErrorKind::DownloadError, "ChunkDownloadFailed", "chunk 7"));
        assert!(!errors.set_error(InstallErrorKind::BuildVerifyFail, "HashMismatch", "a.bin"));

        assert_eq!(errors.kind(), InstallErrorKind::DownloadError);
        assert_eq!(errors.code(), "DL-ChunkDownloadFailed");
        assert_eq!(errors.text(), "chunk 7");
    }

    #[test]
    fn test_cancel_is_not_fatal() {
        let errors = InstallerError::new();
        errors.set_error(InstallErrorKind::UserCanceled, "UserCanceled", "");
        assert!(errors.is_cancelled());
        assert!(!errors.has_fatal_error());

        errors.reset();
        assert!(errors.is_cancelled());
    }

    #[test]
    fn test_reset_clears_retryable_error() {
        let errors = InstallerError::new();
        errors.set_error(InstallErrorKind::MoveFileToInstall, "MoveFailed", "locked");
        assert!(errors.is_retryable());
        assert!(errors.has_fatal_error());

        errors.reset();
        assert_eq!(errors.kind(), InstallErrorKind::NoError);
        assert_eq!(errors.code(), "OK");
    }

    #[test]
    fn test_handlers_run_once_on_first_error() {
        let errors = InstallerError::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        errors.register_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        errors.set_error(InstallErrorKind::FileConstructionFail, "WriteFailed", "disk full");
        errors.set_error(InstallErrorKind::DownloadError, "ChunkDownloadFailed", "");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancellation_replaces_stored_failure() {
        let errors = InstallerError::new();
        errors.set_error(InstallErrorKind::BuildVerifyFail, "HashMismatch", "a.bin");

        assert!(errors.set_cancellation(InstallErrorKind::UserCanceled, "cancelled"));
        assert!(errors.is_cancelled());
        assert!(!errors.has_fatal_error());
        assert_eq!(errors.code(), "UC-UserCanceled");

        // The first cancellation sticks
        assert!(!errors.set_cancellation(InstallErrorKind::ApplicationClosing, "closing"));
        assert_eq!(errors.kind(), InstallErrorKind::UserCanceled);
        assert!(!errors.set_cancellation(InstallErrorKind::DownloadError, ""));
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(InstallErrorKind::FileConstructionFail.is_retryable());
        assert!(InstallErrorKind::MoveFileToInstall.is_retryable());
        assert!(InstallErrorKind::BuildVerifyFail.is_retryable());
        assert!(!InstallErrorKind::DownloadError.is_retryable());
        assert!(!InstallErrorKind::PathLengthExceeded.is_retryable());
        assert!(!InstallErrorKind::UserCanceled.is_retryable());
    }
}
