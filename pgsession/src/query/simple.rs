//! Simple query protocol.
use std::future::poll_fn;

use super::{CommandTag, Event, Running};
use crate::{Result, Row, transport::PgTransport};

/// Rows and tag of one statement of a simple query.
#[derive(Debug, Default)]
pub struct SimpleResult {
    rows: Vec<Row>,
    tag: CommandTag,
}

impl SimpleResult {
    /// Rows in text format.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn tag(&self) -> &CommandTag {
        &self.tag
    }
}

/// Run one or more `;` separated statements with the simple query protocol.
///
/// No parameter can be bound, every value arrives as text. Statements before a failing one
/// are still committed unless they run inside an explicit transaction.
///
/// ```no_run
/// # async fn app(conn: &mut pgsession::Connection) -> pgsession::Result<()> {
/// let results = pgsession::query::simple_query("SELECT 1; SELECT 2", conn).await?;
/// assert_eq!(results.len(), 2);
/// assert_eq!(results[0].rows()[0].get_raw(0)?, Some(&b"1"[..]));
/// # Ok(())
/// # }
/// ```
pub async fn simple_query<IO: PgTransport>(sql: &str, io: IO) -> Result<Vec<SimpleResult>> {
    let mut running = Running::simple(io, sql);
    let mut results = Vec::new();
    let mut current = SimpleResult::default();
    let mut error = None;

    while let Some(event) = poll_fn(|cx| running.poll_event(cx)).await {
        match event {
            Event::Row(_, row) => current.rows.push(row),
            Event::Complete(_, tag) => {
                current.tag = tag;
                results.push(std::mem::take(&mut current));
            }
            Event::Failed(_, err) => {
                error.get_or_insert(err);
            }
        }
    }

    match error {
        Some(err) => Err(err),
        None => Ok(results),
    }
}
