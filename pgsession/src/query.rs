//! Query API types.
//!
//! ```no_run
//! # async fn app(conn: &mut pgsession::Connection) -> pgsession::Result<()> {
//! let (id, name) = pgsession::query::<_, _, (i32, String)>("SELECT $1::int4, 'foo'", &mut *conn)
//!     .bind(420)
//!     .fetch_one()
//!     .await?;
//! assert_eq!(id, 420);
//! assert_eq!(name, "foo");
//!
//! let deleted = pgsession::execute("DELETE FROM post WHERE id = $1", conn).bind(id).await?;
//! # Ok(())
//! # }
//! ```
use futures_core::Stream;
use std::{
    any::Any,
    future::poll_fn,
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll, ready},
};

use crate::{
    Result, Row,
    codec::Param,
    postgres::{PgFormat, PgType},
    row::FromRow,
    sql::Sql,
    transport::PgTransport,
};

mod batch;
mod fetch_all;
mod fetch_one;
mod pipeline;
mod prepare;
mod simple;
mod tag;

pub(crate) use batch::{Batch, Event, Job, Mode, Running};

pub use fetch_all::{Execute, FetchAll};
pub use fetch_one::{FetchOne, FetchOptional};
pub use pipeline::{JobCursor, JobOutput, Pipeline, PipelineResults};
pub use prepare::prepare;
pub use simple::{SimpleResult, simple_query};
pub use tag::CommandTag;

/// Entrypoint of the query API.
pub fn query<'a, SQL, IO, R>(sql: SQL, io: IO) -> Query<'a, IO, R>
where
    SQL: Sql<'a>,
{
    Query::new(sql, io)
}

/// Same as [`query`] with [`Row`] as the output.
pub fn query_row<'a, SQL, IO>(sql: SQL, io: IO) -> Query<'a, IO, Row>
where
    SQL: Sql<'a>,
{
    Query::new(sql, io)
}

/// Same as [`query`] for statements whose rows are ignored, awaiting it returns rows affected.
pub fn execute<'a, SQL, IO>(sql: SQL, io: IO) -> Query<'a, IO, ()>
where
    SQL: Sql<'a>,
{
    Query::new(sql, io)
}

/// The query API.
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Query<'a, IO, R> {
    sql: &'a str,
    persistent: bool,
    io: IO,
    params: Vec<Param>,
    result_format: Option<PgFormat>,
    fetch_size: u32,
    _p: PhantomData<fn() -> R>,
}

impl<'a, IO, R> Query<'a, IO, R> {
    fn new<SQL: Sql<'a>>(sql: SQL, io: IO) -> Self {
        Self {
            sql: sql.sql(),
            persistent: sql.persistent(),
            io,
            params: Vec::new(),
            result_format: None,
            fetch_size: 0,
            _p: PhantomData,
        }
    }

    /// Bind query parameter.
    pub fn bind<T: PgType + Any + Send + Sync>(mut self, value: T) -> Self {
        self.params.push(Param::new(value));
        self
    }

    /// Bind a prepared [`Param`], e.g. [`Param::null`] or [`Param::with_oid`].
    pub fn bind_param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    /// Override the session preferred result format for this query.
    ///
    /// Columns whose type has no decoder in the requested format are still received as text.
    pub fn result_format(mut self, format: PgFormat) -> Self {
        self.result_format = Some(format);
        self
    }

    /// Execute the portal `n` rows at a time, `0` fetches everything at once.
    pub fn fetch_size(mut self, n: u32) -> Self {
        self.fetch_size = n;
        self
    }
}

impl<'a, IO, R> Query<'a, IO, R>
where
    IO: PgTransport,
{
    fn running(self) -> Running<'a, IO> {
        let job = Job {
            sql: self.sql,
            params: self.params,
            persistent: self.persistent,
            result_format: self.result_format,
        };
        Running::single(self.io, job, self.fetch_size)
    }

    /// Fetch rows using [`Stream`] api.
    ///
    /// Dropping the stream before it ends discards the remaining rows, the session resynchronizes
    /// at the start of the next operation.
    pub fn fetch(self) -> RowStream<'a, IO, R> {
        RowStream::new(self.running())
    }

    /// Fetch all rows into [`Vec`].
    pub fn fetch_all(self) -> FetchAll<'a, IO, R>
    where
        R: FromRow + Unpin,
    {
        FetchAll::new(self.fetch())
    }

    /// Fetch the first row, fails with [`RowNotFound`][crate::row::RowNotFound] when there is none.
    pub fn fetch_one(self) -> FetchOne<'a, IO, R>
    where
        R: FromRow + Unpin,
    {
        FetchOne::new(self.running())
    }

    /// Optionally fetch the first row.
    pub fn fetch_optional(self) -> FetchOptional<'a, IO, R>
    where
        R: FromRow + Unpin,
    {
        FetchOptional::new(self.running())
    }

    /// Execute statement and return number of rows affected.
    pub fn execute(self) -> Execute<'a, IO> {
        Execute::new(self.running())
    }

    /// Call `f` on every row, returning the number of rows affected.
    ///
    /// After `f` returns an error it is not called again, the remaining rows are discarded and
    /// the error is returned once the statement completes.
    pub async fn for_each_row<F>(self, mut f: F) -> Result<u64>
    where
        R: FromRow,
        F: FnMut(R) -> Result<()>,
    {
        let mut rows = self.fetch();
        let mut error = None;
        while let Some(row) = rows.next().await {
            if error.is_some() {
                continue;
            }
            if let Err(err) = row.and_then(&mut f) {
                error = Some(err);
            }
        }
        match error {
            Some(err) => Err(err),
            None => Ok(rows.tag().map(CommandTag::rows_affected).unwrap_or_default()),
        }
    }
}

impl<'a, IO, R> IntoFuture for Query<'a, IO, R>
where
    IO: PgTransport,
{
    type Output = Result<u64>;

    type IntoFuture = Execute<'a, IO>;

    fn into_future(self) -> Self::IntoFuture {
        self.execute()
    }
}

/// Rows of a single query, returned from [`Query::fetch`].
///
/// Each item is decoded separately, a decode error is reported on its row and the stream goes on.
/// A server error ends the stream.
#[derive(Debug)]
#[must_use = "streams do nothing unless polled"]
pub struct RowStream<'a, IO: PgTransport, R> {
    running: Running<'a, IO>,
    tag: Option<CommandTag>,
    _p: PhantomData<fn() -> R>,
}

impl<'a, IO: PgTransport, R> RowStream<'a, IO, R> {
    fn new(running: Running<'a, IO>) -> Self {
        Self { running, tag: None, _p: PhantomData }
    }

    /// Command tag, available after the stream ended.
    pub fn tag(&self) -> Option<&CommandTag> {
        self.tag.as_ref()
    }

    /// Poll the next raw event, skipping nothing.
    fn poll_raw(&mut self, cx: &mut Context) -> Poll<Option<Result<Row>>> {
        loop {
            match ready!(self.running.poll_event(cx)) {
                Some(Event::Row(_, row)) => return Poll::Ready(Some(Ok(row))),
                Some(Event::Complete(_, tag)) => self.tag = Some(tag),
                Some(Event::Failed(_, err)) => return Poll::Ready(Some(Err(err))),
                None => return Poll::Ready(None),
            }
        }
    }

    /// Discard remaining rows and return the command tag.
    pub async fn finish(mut self) -> Result<CommandTag> {
        let mut error = None;
        while let Some(row) = poll_fn(|cx| self.poll_raw(cx)).await {
            if let Err(err) = row {
                error.get_or_insert(err);
            }
        }
        match error {
            Some(err) => Err(err),
            None => Ok(self.tag.take().unwrap_or_default()),
        }
    }
}

impl<IO: PgTransport, R: FromRow> RowStream<'_, IO, R> {
    /// Next decoded row.
    pub async fn next(&mut self) -> Option<Result<R>> {
        poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }
}

impl<IO: PgTransport, R: FromRow> Stream for RowStream<'_, IO, R> {
    type Item = Result<R>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();
        match ready!(me.poll_raw(cx)) {
            Some(Ok(row)) => Poll::Ready(Some(R::from_row(row).map_err(Into::into))),
            Some(Err(err)) => Poll::Ready(Some(Err(err))),
            None => Poll::Ready(None),
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::{
        Error,
        error::ErrorKind,
        hooks::Hooks,
        postgres::oid,
        sql::SqlExt,
        statement::CacheMode,
        testing::{MockServer, Reply},
    };

    fn responder(sql: &str, params: &[Option<String>]) -> Reply {
        match sql {
            "SELECT 1" => Reply::int(1),
            "SELECT id FROM post" => Reply::ints("id", 1..=5),
            "SELECT id FROM empty" => Reply::ints("id", []),
            "SELECT $1::int4, $2" => Reply::Rows(
                vec![("a", oid::INT4), ("b", oid::TEXT)],
                vec![params.to_vec()],
            ),
            "INSERT INTO post VALUES (1), (2)" => Reply::command("INSERT 0 2"),
            "SELECT 1/0" => Reply::error("22012", "division by zero"),
            "COPY post FROM STDIN" => Reply::CopyIn,
            _ => Reply::error("42P01", "relation does not exist"),
        }
    }

    #[tokio::test]
    async fn fetch_one_row() {
        let mock = MockServer::start(responder).await;
        let mut conn = mock.connect().await;

        let (one,) = query::<_, _, (i32,)>("SELECT 1", &mut conn).fetch_one().await.unwrap();
        assert_eq!(one, 1);
        assert!(conn.is_healthy());
    }

    #[tokio::test]
    async fn repeated_statement_parsed_once() {
        let mock = MockServer::start(responder).await;
        let mut conn = mock.connect().await;

        for _ in 0..3 {
            let (one,) = query::<_, _, (i32,)>("SELECT 1", &mut conn).fetch_one().await.unwrap();
            assert_eq!(one, 1);
        }
        assert_eq!(mock.count(b'P'), 1);

        // not persistent, parsed on every execution
        for _ in 0..2 {
            execute("SELECT 1".once(), &mut conn).await.unwrap();
        }
        assert_eq!(mock.count(b'P'), 3);
    }

    #[tokio::test]
    async fn bind_parameters() {
        let mock = MockServer::start(responder).await;
        let mut conn = mock.connect().await;

        let (id, name) = query::<_, _, (i32, String)>("SELECT $1::int4, $2", &mut conn)
            .bind(420)
            .bind("foo")
            .fetch_one()
            .await
            .unwrap();
        assert_eq!(id, 420);
        assert_eq!(name, "foo");
    }

    #[tokio::test]
    async fn fetch_variants() {
        let mock = MockServer::start(responder).await;
        let mut conn = mock.connect().await;

        let ids = query::<_, _, (i32,)>("SELECT id FROM post", &mut conn).fetch_all().await.unwrap();
        assert_eq!(ids, [(1,), (2,), (3,), (4,), (5,)]);

        let first = query::<_, _, (i32,)>("SELECT id FROM post", &mut conn).fetch_optional().await.unwrap();
        assert_eq!(first, Some((1,)));

        let none = query::<_, _, (i32,)>("SELECT id FROM empty", &mut conn).fetch_optional().await.unwrap();
        assert_eq!(none, None);

        let err = query::<_, _, (i32,)>("SELECT id FROM empty", &mut conn).fetch_one().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::RowNotFound(_)));

        let inserted = execute("INSERT INTO post VALUES (1), (2)", &mut conn).await.unwrap();
        assert_eq!(inserted, 2);
    }

    #[tokio::test]
    async fn row_stream_and_callback() {
        let mock = MockServer::start(responder).await;
        let mut conn = mock.connect().await;

        let mut rows = query_row("SELECT id FROM post", &mut conn).fetch();
        let mut ids = vec![];
        while let Some(row) = rows.next().await {
            ids.push(row.unwrap().try_get::<_, i32>("id").unwrap());
        }
        assert_eq!(ids, [1, 2, 3, 4, 5]);
        assert_eq!(rows.tag().unwrap().as_str(), "SELECT 5");
        drop(rows);

        let mut sum = 0;
        let affected = query::<_, _, (i32,)>("SELECT id FROM post", &mut conn)
            .for_each_row(|(id,)| {
                sum += id;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!((sum, affected), (15, 5));
    }

    #[tokio::test]
    async fn fetch_size_reissues_execute() {
        let mock = MockServer::start(responder).await;
        let mut conn = mock.connect().await;

        let ids = query::<_, _, (i32,)>("SELECT id FROM post", &mut conn)
            .fetch_size(2)
            .fetch_all()
            .await
            .unwrap();
        assert_eq!(ids.len(), 5);
        assert_eq!(mock.count(b'E'), 3);
        assert!(conn.is_healthy());
    }

    #[tokio::test]
    async fn dropped_chunked_cursor_closes_portal() {
        let mock = MockServer::start(responder).await;
        let mut conn = mock.connect().await;

        let mut rows = query::<_, _, (i32,)>("SELECT id FROM post", &mut conn).fetch_size(2).fetch();
        assert_eq!(rows.next().await.unwrap().unwrap(), (1,));
        drop(rows);

        let (one,) = query::<_, _, (i32,)>("SELECT 1", &mut conn).fetch_one().await.unwrap();
        assert_eq!(one, 1);
        assert_eq!(mock.count(b'C'), 1);
    }

    #[tokio::test]
    async fn dropped_cursor_resynchronizes() {
        let mock = MockServer::start(responder).await;
        let mut conn = mock.connect().await;

        let mut rows = query::<_, _, (i32,)>("SELECT id FROM post", &mut conn).fetch();
        assert_eq!(rows.next().await.unwrap().unwrap(), (1,));
        drop(rows);

        let (one,) = query::<_, _, (i32,)>("SELECT 1", &mut conn).fetch_one().await.unwrap();
        assert_eq!(one, 1);
        assert!(conn.is_healthy());
    }

    #[tokio::test]
    async fn leaked_cursor_conflicts() {
        let mock = MockServer::start(responder).await;
        let mut conn = mock.connect().await;

        let mut rows = query::<_, _, (i32,)>("SELECT id FROM post", &mut conn).fetch();
        assert!(rows.next().await.is_some());
        std::mem::forget(rows);

        let err = execute("SELECT 1", &mut conn).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Conflict(_)));
        assert!(!conn.is_healthy());
    }

    #[tokio::test]
    async fn server_error_keeps_session() {
        let mock = MockServer::start(responder).await;
        let mut conn = mock.connect().await;

        let err = execute("SELECT 1/0", &mut conn).await.unwrap_err();
        assert_eq!(err.code(), Some("22012"));
        assert!(!err.is_fatal());

        let (one,) = query::<_, _, (i32,)>("SELECT 1", &mut conn).fetch_one().await.unwrap();
        assert_eq!(one, 1);
    }

    #[tokio::test]
    async fn stale_statement_retried_once() {
        let mock = MockServer::start(responder).await;
        let mut conn = mock.connect().await;

        execute("SELECT 1", &mut conn).await.unwrap();
        mock.forget_statements();

        let (one,) = query::<_, _, (i32,)>("SELECT 1", &mut conn).fetch_one().await.unwrap();
        assert_eq!(one, 1);
        assert_eq!(mock.count(b'P'), 2);
        assert!(conn.is_healthy());
    }

    #[tokio::test]
    async fn evicted_statement_closed_on_the_wire() {
        let mock = MockServer::start(responder).await;
        let cache = CacheMode::Lru(std::num::NonZeroUsize::new(1).unwrap());
        let mut conn = crate::Connection::connect(&mock.config().statement_cache(cache)).await.unwrap();

        execute("SELECT 1", &mut conn).await.unwrap();
        execute("SELECT id FROM post", &mut conn).await.unwrap();
        // the first eviction is closed in front of the next batch
        assert_eq!((mock.count(b'P'), mock.count(b'C')), (2, 0));

        execute("SELECT id FROM empty", &mut conn).await.unwrap();
        assert_eq!((mock.count(b'P'), mock.count(b'C')), (3, 1));

        execute("INSERT INTO post VALUES (1), (2)", &mut conn).await.unwrap();
        assert_eq!((mock.count(b'P'), mock.count(b'C')), (4, 2));

        let (one,) = query::<_, _, (i32,)>("SELECT 1", &mut conn).fetch_one().await.unwrap();
        assert_eq!(one, 1);
        assert_eq!(mock.count(b'P'), 5);
        assert!(conn.is_healthy());
    }

    #[tokio::test]
    async fn too_many_parameters_rejected_before_sending() {
        let mock = MockServer::start(responder).await;
        let mut conn = mock.connect().await;

        let mut select = query_row("SELECT 1", &mut conn);
        for _ in 0..=u16::MAX {
            select = select.bind_param(Param::null(oid::INT4));
        }
        let err = select.fetch_all().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Protocol(_)));
        assert!(!err.is_fatal());

        assert_eq!(mock.count(b'P'), 0);
        assert!(conn.is_healthy());
        let (one,) = query::<_, _, (i32,)>("SELECT 1", &mut conn).fetch_one().await.unwrap();
        assert_eq!(one, 1);
    }

    #[tokio::test]
    async fn binary_result_format() {
        let mock = MockServer::start(responder).await;
        let mut conn = mock.connect().await;

        let row = query_row("SELECT 1", &mut conn)
            .result_format(PgFormat::Binary)
            .fetch_one()
            .await
            .unwrap();
        assert_eq!(row.columns()[0].format(), PgFormat::Binary);
        assert_eq!(row.try_get::<_, i32>(0).unwrap(), 1);
    }

    #[tokio::test]
    async fn disabled_cache_uses_simple_query() {
        let mock = MockServer::start(responder).await;
        let config = mock.config().statement_cache(CacheMode::Disabled);
        let mut conn = crate::Connection::connect(&config).await.unwrap();

        let (one,) = query::<_, _, (i32,)>("SELECT 1", &mut conn).fetch_one().await.unwrap();
        assert_eq!(one, 1);
        assert_eq!(mock.count(b'P'), 0);
        assert_eq!(mock.queries(), ["SELECT 1"]);
    }

    #[tokio::test]
    async fn copy_through_query_conflicts() {
        let mock = MockServer::start(responder).await;
        let mut conn = mock.connect().await;

        let err = execute("COPY post FROM STDIN", &mut conn).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Conflict(_)));

        let (one,) = query::<_, _, (i32,)>("SELECT 1", &mut conn).fetch_one().await.unwrap();
        assert_eq!(one, 1);
        assert!(conn.is_healthy());
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Hooks for Recorder {
        fn query_start(&self, sql: &str) {
            self.0.lock().unwrap().push(format!("start {sql}"));
        }

        fn query_end(&self, sql: &str, outcome: Result<&CommandTag, &Error>, _: Duration) {
            let outcome = match outcome {
                Ok(tag) => tag.to_string(),
                Err(err) => err.code().unwrap_or("client").to_owned(),
            };
            self.0.lock().unwrap().push(format!("end {sql} {outcome}"));
        }
    }

    #[tokio::test]
    async fn hooks_observe_queries() {
        let mock = MockServer::start(responder).await;
        let recorder = Arc::new(Recorder::default());
        let config = mock.config().hooks(recorder.clone());
        let mut conn = crate::Connection::connect(&config).await.unwrap();

        execute("SELECT 1", &mut conn).await.unwrap();
        execute("SELECT 1/0", &mut conn).await.unwrap_err();

        assert_eq!(
            *recorder.0.lock().unwrap(),
            [
                "start SELECT 1",
                "end SELECT 1 SELECT 1",
                "start SELECT 1/0",
                "end SELECT 1/0 22012",
            ]
        );
    }
}
