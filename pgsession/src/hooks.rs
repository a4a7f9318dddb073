//! Lifecycle callbacks around queries and copies.
//!
//! ```
//! use std::{sync::Arc, time::Duration};
//! use pgsession::{Config, Error, hooks::Hooks, query::CommandTag};
//!
//! struct SlowLog;
//!
//! impl Hooks for SlowLog {
//!     fn query_end(&self, sql: &str, outcome: Result<&CommandTag, &Error>, elapsed: Duration) {
//!         if elapsed > Duration::from_millis(100) {
//!             eprintln!("slow query ({elapsed:?}): {sql} -> {:?}", outcome.map(CommandTag::as_str));
//!         }
//!     }
//! }
//!
//! let config = Config::new().hooks(Arc::new(SlowLog));
//! ```
use std::time::Duration;

use crate::{Error, query::CommandTag};

/// Observer of session operations.
///
/// Every method defaults to doing nothing, hooks have no effect on the operation itself.
pub trait Hooks: Send + Sync {
    /// A statement was sent.
    fn query_start(&self, sql: &str) {
        let _ = sql;
    }

    /// A statement completed, failed, or was abandoned.
    fn query_end(&self, sql: &str, outcome: Result<&CommandTag, &Error>, elapsed: Duration) {
        let _ = (sql, outcome, elapsed);
    }

    /// A `COPY` statement was sent.
    fn copy_start(&self, sql: &str) {
        let _ = sql;
    }

    /// A `COPY` finished with the number of rows copied.
    fn copy_end(&self, sql: &str, outcome: Result<u64, &Error>, elapsed: Duration) {
        let _ = (sql, outcome, elapsed);
    }
}
