//! Shared test-only helpers, so each module's `#[cfg(test)]` block doesn't reinvent a discard
//! logger.

#![cfg(test)]

use slog::{Drain, Logger};

pub fn test_logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}
