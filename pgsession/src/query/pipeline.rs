//! Several statements sent before a single `Sync`.
//!
//! ```no_run
//! use pgsession::{codec::Param, query::Pipeline};
//!
//! # async fn app(conn: &mut pgsession::Connection) -> pgsession::Result<()> {
//! let mut pipeline = Pipeline::new();
//! pipeline
//!     .add("INSERT INTO post(name) VALUES ($1)", vec![Param::new("foo")])
//!     .add("SELECT count(*) FROM post", vec![]);
//!
//! let mut results = pipeline.send(conn);
//! let inserted = results.next_job().expect("first job").finish().await?;
//! let mut count = results.next_job().expect("second job");
//! while let Some(row) = count.next().await {
//!     let total: i64 = row?.try_get(0)?;
//! }
//! # Ok(())
//! # }
//! ```
use futures_core::Stream;
use std::{
    future::poll_fn,
    pin::Pin,
    task::{Context, Poll, ready},
};

use super::{Batch, CommandTag, Event, Job, Mode, Running};
use crate::{Result, Row, codec::Param, sql::Sql, transport::PgTransport};

/// Builder of a pipelined batch.
#[derive(Debug, Default)]
pub struct Pipeline<'a> {
    jobs: Vec<Job<'a>>,
}

impl<'a> Pipeline<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a statement.
    pub fn add(&mut self, sql: impl Sql<'a>, params: Vec<Param>) -> &mut Self {
        let mut job = Job::new(sql.sql(), sql.persistent());
        job.params = params;
        self.jobs.push(job);
        self
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Send every queued statement followed by one `Sync`.
    ///
    /// Nothing is written until the results are polled.
    pub fn send<IO: PgTransport>(self, io: IO) -> PipelineResults<'a, IO> {
        PipelineResults {
            running: Running::new(io, Batch::new(self.jobs, Mode::Extended)),
            next: 0,
            stash: None,
        }
    }
}

/// Results of a [`Pipeline`], consumed job by job in submission order.
#[derive(Debug)]
pub struct PipelineResults<'a, IO: PgTransport> {
    running: Running<'a, IO>,
    /// Index of the next job handed out.
    next: usize,
    /// Event read ahead by the cursor of an earlier job.
    stash: Option<Event>,
}

impl<'a, IO: PgTransport> PipelineResults<'a, IO> {
    /// Cursor over the rows of the next job.
    ///
    /// Rows the previous cursor did not consume are discarded.
    pub fn next_job(&mut self) -> Option<JobCursor<'_, 'a, IO>> {
        if self.next >= self.running.jobs() {
            return None;
        }
        let nth = self.next;
        self.next += 1;
        Some(JobCursor { results: self, nth, tag: None, ended: false })
    }

    /// Collect every remaining job.
    pub async fn collect(mut self) -> Vec<Result<JobOutput>> {
        let mut outputs = Vec::new();
        while let Some(mut cursor) = self.next_job() {
            let mut rows = Vec::new();
            let mut error = None;
            while let Some(row) = cursor.next().await {
                match row {
                    Ok(row) => rows.push(row),
                    Err(err) => error = Some(err),
                }
            }
            outputs.push(match error {
                Some(err) => Err(err),
                None => Ok(JobOutput { rows, tag: cursor.tag.take().unwrap_or_default() }),
            });
        }
        outputs
    }

    fn poll_event(&mut self, cx: &mut Context) -> Poll<Option<Event>> {
        match self.stash.take() {
            Some(event) => Poll::Ready(Some(event)),
            None => self.running.poll_event(cx),
        }
    }
}

/// Rows and tag of one pipelined job.
#[derive(Debug)]
pub struct JobOutput {
    pub rows: Vec<Row>,
    pub tag: CommandTag,
}

/// Rows of one pipelined job.
///
/// A failed job yields its error once, a job skipped because an earlier one failed yields
/// [`Cancelled`][crate::error::Cancelled].
#[derive(Debug)]
pub struct JobCursor<'r, 'a, IO: PgTransport> {
    results: &'r mut PipelineResults<'a, IO>,
    nth: usize,
    tag: Option<CommandTag>,
    ended: bool,
}

impl<IO: PgTransport> JobCursor<'_, '_, IO> {
    /// Position of this job in the pipeline.
    pub fn index(&self) -> usize {
        self.nth
    }

    /// Command tag, available after the cursor ended.
    pub fn tag(&self) -> Option<&CommandTag> {
        self.tag.as_ref()
    }

    pub async fn next(&mut self) -> Option<Result<Row>> {
        poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    /// Discard remaining rows and return the command tag.
    pub async fn finish(mut self) -> Result<CommandTag> {
        let mut error = None;
        while let Some(row) = self.next().await {
            if let Err(err) = row {
                error.get_or_insert(err);
            }
        }
        match error {
            Some(err) => Err(err),
            None => Ok(self.tag.take().unwrap_or_default()),
        }
    }

    fn is_last(&self) -> bool {
        self.nth + 1 == self.results.running.jobs()
    }
}

impl<IO: PgTransport> Stream for JobCursor<'_, '_, IO> {
    type Item = Result<Row>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();
        loop {
            // the last job reads on up to ReadyForQuery, releasing the session
            if me.ended && !me.is_last() {
                return Poll::Ready(None);
            }
            let Some(event) = ready!(me.results.poll_event(cx)) else {
                me.ended = true;
                return Poll::Ready(None);
            };
            match event {
                Event::Row(i, row) if i == me.nth => return Poll::Ready(Some(Ok(row))),
                Event::Complete(i, tag) if i == me.nth => {
                    me.tag = Some(tag);
                    me.ended = true;
                }
                Event::Failed(i, err) if i == me.nth => {
                    me.ended = true;
                    return Poll::Ready(Some(Err(err)));
                }
                // leftover of a cursor dropped early
                Event::Row(i, _) | Event::Complete(i, _) | Event::Failed(i, _) if i < me.nth => {}
                event => {
                    me.results.stash = Some(event);
                    me.ended = true;
                    return Poll::Ready(None);
                }
            }
        }
    }
}
