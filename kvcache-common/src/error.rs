// Copyright 2026 kvcache Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    backtrace::Backtrace,
    fmt::{Debug, Display},
    sync::Arc,
};

/// ErrorKind is all kinds of Error of kvcache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A live entry with the same key exists and overwrite is not allowed.
    ///
    /// Expected under racing writers.
    EntryExists,
    /// The entry does not exist, or it has been washed.
    EntryNotExist,
    /// No memory can be allocated for the request.
    OutOfMemory,
    /// The on-demand wash finds nothing left to reclaim.
    NoReclaimableMemory,
    /// The working set quota is exhausted.
    QuotaExceeded,
    /// All cache ids are in use.
    TooManyCaches,
    /// A cache with the same name is already registered.
    DuplicateName,
    /// Invalid argument.
    InvalidArgument,
    /// The cache is not initialized or has been closed.
    NotInitialized,
    /// Config error.
    Config,
    /// Decode error.
    Decode,
    /// External error.
    External,
}

impl ErrorKind {
    /// Convert self into static str.
    pub fn into_static(self) -> &'static str {
        self.into()
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.into_static())
    }
}

impl From<ErrorKind> for &'static str {
    fn from(v: ErrorKind) -> &'static str {
        match v {
            ErrorKind::EntryExists => "Entry exists",
            ErrorKind::EntryNotExist => "Entry not exist",
            ErrorKind::OutOfMemory => "Out of memory",
            ErrorKind::NoReclaimableMemory => "No reclaimable memory",
            ErrorKind::QuotaExceeded => "Quota exceeded",
            ErrorKind::TooManyCaches => "Too many caches",
            ErrorKind::DuplicateName => "Duplicate name",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::NotInitialized => "Not initialized",
            ErrorKind::Config => "Config error",
            ErrorKind::Decode => "Decode error",
            ErrorKind::External => "External error",
        }
    }
}

/// Error is the error struct returned by all kvcache functions.
///
/// `Display` prints the error in a single line:
///
/// ```shell
/// Quota exceeded, context: { used: 600, limit: 1024, required: 600 } => working set quota exceeded
/// ```
///
/// `Debug` prints the error in multiple lines with context, source and backtrace (if captured).
/// `{:#?}` falls back to the conventional struct-style representation.
pub struct Error {
    kind: ErrorKind,
    message: String,

    context: Vec<(&'static str, String)>,

    source: Option<Arc<anyhow::Error>>,
    backtrace: Option<Arc<Backtrace>>,
}

impl Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if f.alternate() {
            let mut de = f.debug_struct("Error");
            de.field("kind", &self.kind);
            de.field("message", &self.message);
            de.field("context", &self.context);
            de.field("source", &self.source);
            de.field("backtrace", &self.backtrace);
            return de.finish();
        }

        write!(f, "{}", self.kind)?;
        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }
        writeln!(f)?;

        if !self.context.is_empty() {
            writeln!(f)?;
            writeln!(f, "Context:")?;
            for (k, v) in self.context.iter() {
                writeln!(f, "  {k}: {v}")?;
            }
        }

        if let Some(source) = &self.source {
            writeln!(f)?;
            writeln!(f, "Source:")?;
            writeln!(f, "  {source:#}")?;
        }

        if let Some(backtrace) = &self.backtrace {
            writeln!(f)?;
            writeln!(f, "Backtrace:")?;
            writeln!(f, "{backtrace}")?;
        }

        Ok(())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;

        if !self.context.is_empty() {
            write!(f, ", context: {{ ")?;
            let mut iter = self.context.iter().peekable();
            while let Some((k, v)) = iter.next() {
                write!(f, "{k}: {v}")?;
                if iter.peek().is_some() {
                    write!(f, ", ")?;
                }
            }
            write!(f, " }}")?;
        }

        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }

        if let Some(source) = &self.source {
            write!(f, ", source: {source}")?;
        }

        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|v| v.as_ref().as_ref())
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            context: self.context.clone(),
            source: self.source.clone(),
            backtrace: self.backtrace.clone(),
        }
    }
}

impl Error {
    /// Create a new error.
    ///
    /// A backtrace is captured only for kinds that indicate a programming or resource problem. Misses and
    /// insert races are part of normal operation and skip the capture.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let backtrace = match kind {
            ErrorKind::EntryExists | ErrorKind::EntryNotExist | ErrorKind::QuotaExceeded => None,
            _ => Some(Arc::new(Backtrace::capture())),
        };
        Self {
            kind,
            message: message.into(),
            context: Vec::new(),
            source: None,
            backtrace,
        }
    }

    /// Add more context in error.
    pub fn with_context(mut self, key: &'static str, value: impl ToString) -> Self {
        self.context.push((key, value.to_string()));
        self
    }

    /// Set source for error.
    ///
    /// # Notes
    ///
    /// If the source has been set, we will raise a panic here.
    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        debug_assert!(self.source.is_none(), "the source error has been set");
        self.source = Some(Arc::new(source.into()));
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the error context.
    pub fn context(&self) -> &Vec<(&'static str, String)> {
        &self.context
    }

    /// Get the error backtrace.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_deref()
    }

    /// Get the error source.
    pub fn source(&self) -> Option<&anyhow::Error> {
        self.source.as_deref()
    }

    /// Downcast the reference of the source error to a specific error type reference.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source.as_deref().and_then(|e| e.downcast_ref::<E>())
    }

    /// Check if the error is [`ErrorKind::EntryExists`].
    pub fn is_entry_exists(&self) -> bool {
        self.kind == ErrorKind::EntryExists
    }

    /// Check if the error is [`ErrorKind::EntryNotExist`].
    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::EntryNotExist
    }
}

/// Result type for kvcache.
pub type Result<T> = std::result::Result<T, Error>;

/// Helper methods for Error.
impl Error {
    /// Helper for creating an [`ErrorKind::EntryExists`] error.
    pub fn entry_exists() -> Self {
        Error::new(ErrorKind::EntryExists, "")
    }

    /// Helper for creating an [`ErrorKind::EntryNotExist`] error.
    pub fn not_found() -> Self {
        Error::new(ErrorKind::EntryNotExist, "")
    }

    /// Helper for creating an [`ErrorKind::OutOfMemory`] error with context.
    pub fn out_of_memory(capacity: usize, allocated: usize, required: usize) -> Self {
        Error::new(ErrorKind::OutOfMemory, "not enough memory left for a new block")
            .with_context("capacity", capacity)
            .with_context("allocated", allocated)
            .with_context("required", required)
    }

    /// Helper for creating an [`ErrorKind::QuotaExceeded`] error with context.
    pub fn quota_exceeded(used: usize, limit: usize, required: usize) -> Self {
        Error::new(ErrorKind::QuotaExceeded, "working set quota exceeded")
            .with_context("used", used)
            .with_context("limit", limit)
            .with_context("required", required)
    }

    /// Helper for creating an [`ErrorKind::InvalidArgument`] error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidArgument, message)
    }

    /// Helper for creating an [`ErrorKind::NotInitialized`] error.
    pub fn not_initialized() -> Self {
        Error::new(ErrorKind::NotInitialized, "the global cache is not initialized or has been closed")
    }

    /// Helper for creating an [`ErrorKind::Config`] error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Config, message)
    }

    /// Helper for creating an [`ErrorKind::Decode`] error with the buffer sizes.
    pub fn decode(message: impl Into<String>, expected: usize, actual: usize) -> Self {
        Error::new(ErrorKind::Decode, message)
            .with_context("expected", expected)
            .with_context("actual", actual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_send_sync_static<T: Send + Sync + 'static>() {}

    #[test]
    fn test_send_sync_static() {
        is_send_sync_static::<Error>();
    }

    #[derive(Debug)]
    struct BudgetError(&'static str);

    impl Display for BudgetError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "BudgetError: {}", self.0)
        }
    }

    impl std::error::Error for BudgetError {}

    #[test]
    fn test_error_display() {
        let err = Error::quota_exceeded(600, 1024, 600);
        assert_eq!(
            err.to_string(),
            "Quota exceeded, context: { used: 600, limit: 1024, required: 600 } => working set quota exceeded"
        );
        assert!(err.backtrace().is_none());

        let err = Error::new(ErrorKind::External, "budget source failed").with_source(BudgetError("tenant 1002"));
        assert_eq!(
            err.to_string(),
            "External error => budget source failed, source: BudgetError: tenant 1002"
        );
        assert!(err.downcast_ref::<BudgetError>().is_some());
    }

    #[test]
    fn test_error_debug() {
        let err = Error::out_of_memory(1024, 1024, 512);
        let s = format!("{err:?}");
        assert!(s.starts_with("Out of memory => not enough memory left for a new block\n"));
        assert!(s.contains("Context:\n  capacity: 1024\n  allocated: 1024\n  required: 512\n"));

        let s = format!("{err:#?}");
        assert!(s.starts_with("Error {"));
        assert!(s.contains("kind: OutOfMemory"));
    }

    #[test]
    fn test_error_predicates() {
        assert!(Error::entry_exists().is_entry_exists());
        assert!(Error::not_found().is_not_found());
        assert!(!Error::not_found().is_entry_exists());
        assert_eq!(Error::not_initialized().kind(), ErrorKind::NotInitialized);
    }
}
