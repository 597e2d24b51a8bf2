//! `err.rs` - because nothing ever goes right.
//!
//! One flat `ErrorKind` carries the taxonomy of things that can go wrong while resolving a
//! project, acquiring a module or driving its lifecycle. Individual call sites attach the kind
//! as context on top of whatever lower-level `failure::Error` actually happened, so a caller can
//! match on `.kind()` without losing the underlying cause chain.

use failure::{Backtrace, Context, Fail};
use std::fmt::{self, Display};
use std::process::{ExitStatus, Output};

pub type Res<T> = Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    inner: Context<ErrorKind>,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.inner.get_context().clone()
    }
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Error {
        Error { inner }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error {
            inner: e.context(ErrorKind::Io),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error {
            inner: failure::Error::from(e).context(ErrorKind::ConfigInvalid),
        }
    }
}

/// The taxonomy from the design's error-handling section. Each variant corresponds to one of the
/// documented failure categories; `Io` and `Other` exist to carry lower-level causes that don't
/// neatly fit a named category without forcing every `?` site to pick one.
#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum ErrorKind {
    #[fail(display = "project configuration is invalid: {}", _0)]
    ConfigInvalid(String),
    #[fail(display = "could not acquire exclusive access to cache: {}", _0)]
    CacheLocked(String),
    #[fail(display = "failed to acquire module `{}`: {}", name, detail)]
    AcquisitionFailed { name: String, detail: String },
    #[fail(display = "module `{}` is missing package.json", _0)]
    ManifestMissing(String),
    #[fail(display = "one or more imports could not be resolved:\n{}", _0)]
    GraphUnresolved(String),
    #[fail(
        display = "module `{}` tried to use un-imported interface `{}`",
        module, interface
    )]
    ImportNotPermitted { module: String, interface: String },
    #[fail(display = "lifecycle callback failed for module `{}`: {}", module, detail)]
    LifecycleCallbackError { module: String, detail: String },
    #[fail(display = "build artifact is missing; run `build` first")]
    BuildMissing,
    #[fail(display = "underlying I/O error")]
    Io,
    #[fail(display = "{}", _0)]
    Other(String),
}

/// An external-process failure, carrying the command's combined output so callers can surface
/// `stderr || stdout` verbatim, as the acquisition-failure category requires.
#[derive(Debug, Fail)]
#[fail(display = "{}", desc)]
pub struct ProcessError {
    pub desc: String,
    pub exit: Option<ExitStatus>,
    pub output: Option<Output>,
}

impl ProcessError {
    pub fn combined_output(&self) -> String {
        match &self.output {
            Some(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                let stdout = String::from_utf8_lossy(&out.stdout);
                if !stderr.trim().is_empty() {
                    stderr.into_owned()
                } else {
                    stdout.into_owned()
                }
            }
            None => String::new(),
        }
    }
}
