//! Extended query reply state machine.
//!
//! A [`Batch`] sends one or more jobs before a single `Sync`, then reads the replies in the order
//! the jobs were sent. For each job the backend replies:
//!
//! ```text
//! [ParseComplete] BindComplete [RowDescription | NoData] DataRow* (CommandComplete | EmptyQueryResponse)
//! ```
//!
//! A prepare batch describes the statement instead of running it:
//!
//! ```text
//! [ParseComplete] ParameterDescription (RowDescription | NoData)
//! ```
//!
//! After an `ErrorResponse` the backend skips everything until `Sync`, the remaining jobs are
//! reported [`Cancelled`][crate::error::Cancelled] and the batch still reads up to `ReadyForQuery`.
use std::{
    collections::VecDeque,
    sync::Arc,
    task::{Context, Poll, ready},
    time::Instant,
};

use crate::{
    Error, Result, Row,
    codec::{Encoded, Param},
    common::verbose,
    connection::{Activity, SessionState, TxStatus},
    postgres::{BackendMessage, Oid, PgFormat, ProtocolError, backend, frontend},
    row::Column,
    sql::is_rollback,
    statement::{PreparedStatement, StatementName, cache_key},
    transaction::AbortedTransaction,
    transport::PgTransport,
};

use super::CommandTag;

const COPY_IN_REJECTED: &str = "COPY FROM STDIN through the query API";

/// One statement of a batch.
#[derive(Debug)]
pub(crate) struct Job<'a> {
    pub(crate) sql: &'a str,
    pub(crate) params: Vec<Param>,
    pub(crate) persistent: bool,
    pub(crate) result_format: Option<PgFormat>,
}

impl<'a> Job<'a> {
    pub(crate) fn new(sql: &'a str, persistent: bool) -> Self {
        Self { sql, params: Vec::new(), persistent, result_format: None }
    }
}

/// Progress of a batch, tagged with the job index.
#[derive(Debug)]
pub(crate) enum Event {
    Row(usize, Row),
    Complete(usize, CommandTag),
    Failed(usize, Error),
}

/// How the statement text reaches the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// `Parse`/`Bind`/`Describe`/`Execute` per job, one `Sync`.
    Extended,
    /// Single `Query` message, text results, possibly multiple statements.
    Simple,
    /// Single job executed `n` rows at a time with `Flush`, `Sync` after completion.
    Chunked(u32),
    /// `Parse`/`Describe` of the statement, nothing is executed.
    Prepare,
}

#[derive(Debug)]
struct Plan {
    key: u64,
    stmt: StatementName,
    /// Statement came from the cache, no `Parse` was sent.
    reused: bool,
    /// `Parse` was sent for a statement stored in the cache.
    caching: bool,
    parsed: bool,
    /// Parameter types from `ParameterDescription`.
    params: Option<Arc<[Oid]>>,
    columns: Option<Arc<[Column]>>,
    started: Instant,
    done: bool,
}

#[derive(Debug)]
enum Phase {
    Send,
    Read,
    Done,
}

#[derive(Debug)]
pub(crate) struct Batch<'a> {
    jobs: Vec<Job<'a>>,
    plans: Vec<Plan>,
    mode: Mode,
    phase: Phase,
    /// Job whose replies are being read.
    current: usize,
    /// `CloseComplete` still expected before the first job replies.
    closes: usize,
    failed: bool,
    /// `Sync` was written, only tracked in chunked mode.
    synced: bool,
    /// Rows delivered for the current job.
    rows: usize,
    /// Stale statement error held until `ReadyForQuery` decides whether to retry.
    stale: Option<Error>,
    retried: bool,
    /// Backend is streaming a `COPY TO STDOUT` nobody asked for.
    copy_out: bool,
    /// Next `ErrorResponse` answers our own `CopyFail`.
    copy_in_rejected: bool,
    events: VecDeque<Event>,
}

impl<'a> Batch<'a> {
    pub(crate) fn new(jobs: Vec<Job<'a>>, mode: Mode) -> Self {
        Self {
            jobs,
            plans: Vec::new(),
            mode,
            phase: Phase::Send,
            current: 0,
            closes: 0,
            failed: false,
            synced: false,
            rows: 0,
            stale: None,
            retried: false,
            copy_out: false,
            copy_in_rejected: false,
            events: VecDeque::new(),
        }
    }

    /// Single job, using the simple query fast path when nothing needs the extended protocol.
    pub(crate) fn single(job: Job<'a>, fetch_size: u32, session: &SessionState) -> Self {
        let format = job.result_format.unwrap_or(session.result_format);
        let mode = if fetch_size > 0 {
            Mode::Chunked(fetch_size)
        } else if !session.statements.is_enabled() && job.params.is_empty() && format == PgFormat::Text {
            Mode::Simple
        } else {
            Mode::Extended
        };
        Self::new(vec![job], mode)
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Poll the next event, [`None`] after `ReadyForQuery`.
    pub(crate) fn poll_event<IO: PgTransport>(&mut self, io: &mut IO, cx: &mut Context) -> Poll<Option<Event>> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Poll::Ready(Some(event));
            }

            match self.phase {
                Phase::Send => {
                    if !self.retried {
                        if let Err(err) = ready!(io.poll_ready(cx)) {
                            self.fail_from(0, 0, err);
                            self.phase = Phase::Done;
                            continue;
                        }
                    }
                    match self.send(io) {
                        Ok(()) => self.phase = Phase::Read,
                        Err((nth, err)) => {
                            self.fail_from(0, nth, err);
                            self.phase = Phase::Done;
                        }
                    }
                }
                Phase::Read => {
                    let result = ready!(io.poll_recv::<BackendMessage>(cx));
                    if let Err(err) = self.handle(io, result) {
                        io.session().broken = true;
                        if self.current < self.jobs.len() {
                            self.fail_from(self.current, self.current, err);
                        } else {
                            verbose!(%err, "session lost after the last job completed");
                        }
                        self.finish(io);
                    }
                }
                Phase::Done => return Poll::Ready(None),
            }
        }
    }

    /// Write every message of the batch, nothing is written if any parameter fails to encode.
    fn send<IO: PgTransport>(&mut self, io: &mut IO) -> Result<(), (usize, Error)> {
        let session = io.session();

        if !self.retried
            && session.tx_status == TxStatus::Failed
            && self.jobs.first().is_some_and(|job| !is_rollback(job.sql))
        {
            return Err((0, AbortedTransaction.into()));
        }

        let registry = session.registry.clone();
        let mut encoded = Vec::with_capacity(self.jobs.len());
        for (nth, job) in self.jobs.iter().enumerate() {
            frontend::check_len("statement text", job.sql.len()).map_err(|err| (nth, err.into()))?;
            encoded.push(Encoded::new(&job.params, &registry).map_err(|err| (nth, err))?);
        }

        session.activity = Some(Activity::Query);
        let preferred = session.result_format;
        let hooks = session.hooks();

        self.plans.clear();

        // evicted statements are closed by the next extended batch
        if self.mode == Mode::Simple {
            let job = &self.jobs[0];
            io.send(frontend::Query { sql: job.sql });
            self.plans.push(Plan {
                key: 0,
                stmt: StatementName::unnamed(),
                reused: false,
                caching: false,
                parsed: true,
                params: None,
                columns: None,
                started: Instant::now(),
                done: false,
            });
            if let Some(hooks) = &hooks {
                hooks.query_start(job.sql);
            }
            return Ok(());
        }

        for name in io.session().statements.take_pending_close() {
            verbose!(name = %name, "close statement");
            io.send(frontend::Close { variant: b'S', name: name.as_str() });
            self.closes += 1;
        }

        for (job, params) in self.jobs.iter().zip(encoded) {
            let session = io.session();
            let key = cache_key(job.sql, &params.oids);
            let preferred = job.result_format.unwrap_or(preferred);

            let cached = match job.persistent {
                true => session
                    .statements
                    .get(key, job.sql, &params.oids)
                    .map(|stmt| (stmt.name().clone(), stmt.columns().cloned())),
                false => None,
            };
            let reused = cached.is_some();

            let (stmt, caching, columns) = match cached {
                Some((stmt, columns)) => (stmt, false, columns),
                None => {
                    let named = match job.persistent {
                        true => session.statements.insert(key, job.sql, &params.oids),
                        false => None,
                    };
                    let caching = named.is_some();
                    let stmt = named.unwrap_or_else(StatementName::unnamed);
                    io.send(frontend::Parse {
                        prepare_name: stmt.as_str(),
                        sql: job.sql,
                        oids: &params.oids,
                    });
                    (stmt, caching, None)
                }
            };

            if self.mode == Mode::Prepare {
                io.send(frontend::Describe { kind: b'S', name: stmt.as_str() });
                if let Some(hooks) = &hooks {
                    hooks.query_start(job.sql);
                }
                self.plans.push(Plan {
                    key,
                    stmt,
                    reused,
                    caching,
                    parsed: false,
                    params: None,
                    columns: None,
                    started: Instant::now(),
                    done: false,
                });
                continue;
            }

            // known columns get a per column format, text for types the registry cannot decode
            let (formats, columns) = match columns {
                Some(columns) => {
                    let registry = &io.session().registry;
                    let formats = columns
                        .iter()
                        .map(|col| registry.result_format(col.type_oid(), preferred))
                        .collect::<Vec<_>>();
                    let columns = Column::with_formats(&columns, &formats);
                    (formats, Some(columns))
                }
                None => (vec![preferred], None),
            };

            io.send(frontend::Bind {
                portal_name: "",
                stmt_name: stmt.as_str(),
                param_formats: &params.formats,
                params: &params.values,
                result_formats: &formats,
            });
            if columns.is_none() {
                io.send(frontend::Describe { kind: b'P', name: "" });
            }
            let max_row = match self.mode {
                Mode::Chunked(n) => n,
                _ => 0,
            };
            io.send(frontend::Execute { portal_name: "", max_row });

            if let Some(hooks) = &hooks {
                hooks.query_start(job.sql);
            }
            self.plans.push(Plan {
                key,
                stmt,
                reused,
                caching,
                parsed: false,
                params: None,
                columns,
                started: Instant::now(),
                done: false,
            });
        }

        match self.mode {
            Mode::Chunked(_) => io.send(frontend::Flush),
            _ => io.send(frontend::Sync),
        }

        verbose!(jobs = self.jobs.len(), mode = ?self.mode, "batch sent");
        Ok(())
    }

    /// Handle one reply, errors returned here are fatal.
    fn handle<IO: PgTransport>(&mut self, io: &mut IO, result: Result<BackendMessage>) -> Result<()> {
        use BackendMessage::*;

        let message = match result {
            Ok(message) => message,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                self.server_error(io, err);
                return Ok(());
            }
        };

        if let ReadyForQuery(_) = message {
            self.ready_for_query(io);
            return Ok(());
        }

        if self.failed {
            // backend skips everything until Sync, only leftovers of the failed job arrive here
            return Ok(());
        }

        match message {
            CloseComplete(_) => self.closes = self.closes.saturating_sub(1),
            ParseComplete(_) => self.plan_mut()?.parsed = true,
            BindComplete(_) => {}
            ParameterDescription(pd) => {
                let params = Arc::<[Oid]>::from(pd.to_oids()?);
                let plan = self.plan_mut()?;
                if !plan.stmt.is_unnamed() {
                    io.session().statements.set_params(plan.key, &plan.stmt, params.clone());
                }
                plan.params = Some(params);
            }
            RowDescription(rd) => {
                let columns = Column::parse_description(rd)?;
                self.describe(io, columns)?;
            }
            NoData(_) => self.describe(io, Arc::from([]))?,
            DataRow(dr) => {
                let columns = self
                    .plan_mut()?
                    .columns
                    .clone()
                    .ok_or(ProtocolError::unexpected_phase(backend::DataRow::MSGTYPE, "row before description"))?;
                let registry = io.session().registry.clone();
                let row = Row::new(columns, registry, dr)?;
                self.rows += 1;
                self.events.push_back(Event::Row(self.current, row));
            }
            CommandComplete(_) if self.copy_out => {
                self.copy_out = false;
                self.job_failed(io, Error::conflict("COPY TO STDOUT through the query API"));
                self.advance();
            }
            CommandComplete(cmd) => self.complete(io, CommandTag::new(cmd.tag)),
            EmptyQueryResponse(_) => self.complete(io, CommandTag::empty()),
            f @ PortalSuspended(_) => {
                let Mode::Chunked(max_row) = self.mode else {
                    return Err(f.unexpected("unlimited execute").into());
                };
                verbose!(rows = self.rows, "portal suspended");
                io.send(frontend::Execute { portal_name: "", max_row });
                io.send(frontend::Flush);
            }
            CopyInResponse(_) => {
                // reject the copy, the backend answers with an error
                io.send(frontend::CopyFail { reason: COPY_IN_REJECTED });
                if self.mode != Mode::Simple {
                    io.send(frontend::Sync);
                    self.synced = true;
                    if self.mode == Mode::Extended && self.current + 1 < self.jobs.len() {
                        // the next job aborts the copy, so the first Sync is answered too
                        io.session().pending_ready += 1;
                    }
                }
                self.copy_in_rejected = true;
            }
            CopyOutResponse(_) => self.copy_out = true,
            CopyData(_) | CopyDone(_) if self.copy_out => {}
            f => return Err(f.unexpected("query reply").into()),
        }

        Ok(())
    }

    fn plan_mut(&mut self) -> Result<&mut Plan, ProtocolError> {
        self.plans
            .get_mut(self.current)
            .ok_or(ProtocolError::malformed("reply for a job that was never sent"))
    }

    fn describe<IO: PgTransport>(&mut self, io: &mut IO, columns: Arc<[Column]>) -> Result<()> {
        let plan = self.plan_mut()?;
        if !plan.stmt.is_unnamed() {
            io.session().statements.set_columns(plan.key, &plan.stmt, columns.clone());
        }
        plan.columns = Some(columns);
        if self.mode == Mode::Prepare {
            self.complete(io, CommandTag::empty());
        }
        Ok(())
    }

    fn complete<IO: PgTransport>(&mut self, io: &mut IO, tag: CommandTag) {
        let nth = self.current;
        if let Some(plan) = self.plans.get_mut(nth) {
            if let Some(hooks) = io.session().hooks() {
                hooks.query_end(self.jobs[nth].sql, Ok(&tag), plan.started.elapsed());
            }
            match self.mode {
                // a simple query may carry several statements, each with its own description
                Mode::Simple => plan.columns = None,
                _ => plan.done = true,
            }
        }
        self.events.push_back(Event::Complete(nth, tag));

        if let Mode::Chunked(_) = self.mode {
            io.send(frontend::Sync);
            self.synced = true;
        }
        self.advance();
    }

    fn advance(&mut self) {
        self.rows = 0;
        if self.mode != Mode::Simple {
            self.current += 1;
        }
    }

    fn server_error<IO: PgTransport>(&mut self, io: &mut IO, err: Error) {
        if std::mem::take(&mut self.copy_in_rejected) {
            self.job_failed(io, Error::conflict(COPY_IN_REJECTED));
        } else if self.failed {
            return;
        } else if self.stale_retry(io, &err) {
            verbose!("stale statement, retry after sync");
            self.stale = Some(err);
        } else {
            self.job_failed(io, err);
        }

        self.failed = true;
        for nth in self.current + 1..self.jobs.len() {
            self.cancel_plan(io, nth);
            self.events.push_back(Event::Failed(nth, Error::cancelled()));
        }

        if let Mode::Chunked(_) = self.mode {
            if !self.synced {
                io.send(frontend::Sync);
                self.synced = true;
            }
        }
    }

    /// Returns `true` if re-parsing may recover this error.
    fn stale_retry<IO: PgTransport>(&mut self, io: &mut IO, err: &Error) -> bool {
        if !err.is_stale_statement() {
            return false;
        }
        let Some(plan) = self.plans.get_mut(self.current) else {
            return false;
        };
        if !plan.stmt.is_unnamed() {
            io.session().statements.discard(plan.key, &plan.stmt);
            plan.caching = false;
        }
        plan.reused
            && !self.retried
            && self.jobs.len() == 1
            && self.rows == 0
            && matches!(self.mode, Mode::Extended | Mode::Prepare)
    }

    fn job_failed<IO: PgTransport>(&mut self, io: &mut IO, err: Error) {
        let nth = self.current.min(self.jobs.len().saturating_sub(1));
        self.cancel_plan(io, nth);
        if let Some(plan) = self.plans.get_mut(nth) {
            if let Some(hooks) = io.session().hooks() {
                hooks.query_end(self.jobs[nth].sql, Err(&err), plan.started.elapsed());
            }
            plan.done = true;
        }
        self.events.push_back(Event::Failed(nth, err));
    }

    /// Forget a cached statement the backend never confirmed parsing.
    fn cancel_plan<IO: PgTransport>(&mut self, io: &mut IO, nth: usize) {
        if let Some(plan) = self.plans.get_mut(nth) {
            if plan.caching && !plan.parsed {
                io.session().statements.discard(plan.key, &plan.stmt);
                plan.caching = false;
            }
        }
    }

    fn ready_for_query<IO: PgTransport>(&mut self, io: &mut IO) {
        if let Some(err) = self.stale.take() {
            if io.session().tx_status != TxStatus::Failed {
                self.retried = true;
                self.failed = false;
                self.synced = false;
                self.current = 0;
                self.rows = 0;
                self.phase = Phase::Send;
                return;
            }
            self.job_failed(io, err);
        }

        if !self.failed && self.mode != Mode::Simple {
            for nth in self.current..self.jobs.len() {
                self.events.push_back(Event::Failed(nth, Error::cancelled()));
            }
        }
        self.finish(io);
    }

    /// Report `err` on job `nth`, cancelling every other job from `from`.
    fn fail_from(&mut self, from: usize, nth: usize, err: Error) {
        for i in from..nth {
            self.events.push_back(Event::Failed(i, Error::cancelled()));
        }
        self.events.push_back(Event::Failed(nth, err));
        for i in nth + 1..self.jobs.len() {
            self.events.push_back(Event::Failed(i, Error::cancelled()));
        }
    }

    fn finish<IO: PgTransport>(&mut self, io: &mut IO) {
        self.phase = Phase::Done;
        io.session().activity = None;
    }

    /// Batch dropped before `ReadyForQuery`.
    pub(crate) fn abandon<IO: PgTransport>(&mut self, io: &mut IO) {
        match self.phase {
            Phase::Done => return,
            // nothing was written yet
            Phase::Send if !self.retried => {
                self.phase = Phase::Done;
                return;
            }
            _ => self.phase = Phase::Done,
        }

        for nth in self.current..self.plans.len() {
            self.cancel_plan(io, nth);
        }
        if let Mode::Chunked(_) = self.mode {
            if !self.failed && self.plans.first().is_some_and(|plan| !plan.done) {
                io.send(frontend::Close { variant: b'P', name: "" });
            }
        }
        if let Some(hooks) = io.session().hooks() {
            let err = Error::cancelled();
            for (job, plan) in self.jobs.iter().zip(&self.plans).filter(|(_, plan)| !plan.done) {
                hooks.query_end(job.sql, Err(&err), plan.started.elapsed());
            }
        }
        verbose!("batch abandoned");
        io.ready_request();
    }
}

/// A [`Batch`] bound to its transport, abandoned when dropped before completion.
#[derive(Debug)]
pub(crate) struct Running<'a, IO: PgTransport> {
    pub(crate) io: IO,
    batch: Batch<'a>,
}

impl<'a, IO: PgTransport> Running<'a, IO> {
    pub(crate) fn new(io: IO, batch: Batch<'a>) -> Self {
        Self { io, batch }
    }

    /// Build a single job batch, choosing the mode from the session settings.
    pub(crate) fn single(mut io: IO, job: Job<'a>, fetch_size: u32) -> Self {
        let batch = Batch::single(job, fetch_size, io.session());
        Self { io, batch }
    }

    /// Run `sql` with the simple query protocol.
    pub(crate) fn simple(io: IO, sql: &'a str) -> Self {
        Self::new(io, Batch::new(vec![Job::new(sql, false)], Mode::Simple))
    }

    /// Describe `sql` without executing it.
    pub(crate) fn prepare(io: IO, sql: &'a str) -> Self {
        Self::new(io, Batch::new(vec![Job::new(sql, true)], Mode::Prepare))
    }

    pub(crate) fn jobs(&self) -> usize {
        self.batch.len()
    }

    /// Statement described by a prepare batch.
    pub(crate) fn prepared(&self) -> Option<PreparedStatement> {
        let job = self.batch.jobs.first()?;
        let plan = self.batch.plans.first()?;
        Some(PreparedStatement::new(
            plan.stmt.clone(),
            job.sql,
            &[],
            plan.params.clone(),
            plan.columns.clone(),
        ))
    }

    pub(crate) fn poll_event(&mut self, cx: &mut Context) -> Poll<Option<Event>> {
        self.batch.poll_event(&mut self.io, cx)
    }

    /// Read every remaining event, returning the last tag or the first error.
    pub(crate) async fn finish(&mut self) -> Result<CommandTag> {
        let mut tag = CommandTag::empty();
        let mut error = None;
        while let Some(event) = std::future::poll_fn(|cx| self.poll_event(cx)).await {
            match event {
                Event::Row(..) => {}
                Event::Complete(_, complete) => tag = complete,
                Event::Failed(_, err) => {
                    error.get_or_insert(err);
                }
            }
        }
        match error {
            Some(err) => Err(err),
            None => Ok(tag),
        }
    }
}

impl<IO: PgTransport> Drop for Running<'_, IO> {
    fn drop(&mut self) {
        self.batch.abandon(&mut self.io);
    }
}
