use std::io;
use thiserror::Error;

/// Failure of the underlying stack or context mechanism.
///
/// None of these are recoverable: once one is observed the execution state of the
/// thread can no longer be trusted, so it is only ever handed to [`fatal`].
#[derive(Debug, Error)]
pub(crate) enum ContextError {
    #[error("failed to map a {size} byte fiber stack")]
    StackMap {
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("fiber stack of {size} bytes does not fit in the address space")]
    StackTooLarge { size: usize },
    #[error("failed to protect the fiber stack guard page")]
    GuardPage(#[source] io::Error),
    #[error("failed to capture the execution context")]
    Capture(#[source] io::Error),
    #[error("failed to switch execution context")]
    Switch(#[source] io::Error),
    #[error("fiber entry function returned")]
    EntryReturned,
}

impl ContextError {
    pub(crate) fn last_os(f: impl FnOnce(io::Error) -> Self) -> Self {
        f(io::Error::last_os_error())
    }
}

/// Abort the process. Never unwinds.
#[cold]
#[inline(never)]
pub(crate) fn fatal(err: ContextError) -> ! {
    tracing::error!(error = %err, source = ?std::error::Error::source(&err), "fatal fiber error");
    eprintln!("fiber-context: {}", err);
    std::process::abort()
}

#[test]
fn error_messages() {
    let err = ContextError::StackMap {
        size: 4096,
        source: io::Error::from_raw_os_error(libc::ENOMEM),
    };
    assert_eq!(err.to_string(), "failed to map a 4096 byte fiber stack");
    assert!(std::error::Error::source(&err).is_some());
    assert_eq!(
        ContextError::StackTooLarge { size: usize::MAX }.to_string(),
        format!("fiber stack of {} bytes does not fit in the address space", usize::MAX)
    );
    assert_eq!(
        ContextError::EntryReturned.to_string(),
        "fiber entry function returned"
    );
}
