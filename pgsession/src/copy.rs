//! `COPY` sub-protocol.
//!
//! While a [`CopyIn`] or [`CopyOut`] is open the session accepts no other operation. Dropping
//! either before it finished aborts the copy, the session resynchronizes with the next operation.
//!
//! ```no_run
//! # async fn app(conn: &mut pgsession::Connection) -> pgsession::Result<()> {
//! let mut copy = pgsession::copy::copy_in("COPY post(id, name) FROM STDIN", &mut *conn).await?;
//! copy.send(b"1\tfoo\n").await?;
//! copy.send(b"2\tbar\n").await?;
//! assert_eq!(copy.finish().await?, 2);
//!
//! let mut out = pgsession::copy::copy_out("COPY post TO STDOUT", conn).await?;
//! while let Some(chunk) = out.next().await {
//!     print!("{}", String::from_utf8_lossy(&chunk?));
//! }
//! # Ok(())
//! # }
//! ```
use bytes::{BufMut, Bytes, BytesMut};
use futures_core::Stream;
use std::{
    future::poll_fn,
    pin::Pin,
    task::{Context, Poll, ready},
    time::Instant,
};

use crate::{
    Error, Result,
    codec::Param,
    common::{span, verbose},
    connection::{Activity, TxStatus},
    postgres::{BackendMessage, frontend},
    query::CommandTag,
    sql::{quote_ident, quote_qualified},
    transaction::AbortedTransaction,
    transport::{PgTransport, PgTransportExt},
};

/// Buffered `CopyData` flushed once it reaches this size.
const FLUSH_THRESHOLD: usize = 64 * 1024;

/// Largest `CopyData` body written, bigger chunks are split.
const MAX_COPY_DATA: usize = 1024 * 1024;

/// Header of `COPY ... (FORMAT binary)`: signature, flags, header extension length.
const BINARY_HEADER: &[u8] = b"PGCOPY\n\xff\r\n\0\0\0\0\0\0\0\0\0";

/// Start `COPY ... FROM STDIN`.
pub async fn copy_in<IO: PgTransport>(sql: &str, io: IO) -> Result<CopyIn<'_, IO>> {
    span!("copy_in");
    let mut copy = CopyIn {
        io,
        sql,
        started: Instant::now(),
        unflushed: 0,
        done: false,
    };
    start(&mut copy.io, sql, Activity::CopyIn).await?;

    loop {
        use BackendMessage::*;
        match copy.io.recv().await {
            Ok(CopyInResponse(_)) => break,
            Ok(CopyOutResponse(_)) => {
                copy.done = true;
                let err = reject(&mut copy.io, "COPY TO STDOUT started as COPY FROM STDIN").await;
                return Err(end(&mut copy.io, sql, copy.started, err));
            }
            Ok(ReadyForQuery(_)) => {
                copy.done = true;
                let err = Error::conflict("statement is not COPY FROM STDIN");
                return Err(end(&mut copy.io, sql, copy.started, err));
            }
            // not a copy, its replies are discarded
            Ok(_) => {}
            Err(err) => {
                copy.done = true;
                return Err(copy.fail(err).await);
            }
        }
    }

    verbose!("copy in started");
    Ok(copy)
}

/// Start `COPY ... TO STDOUT`.
pub async fn copy_out<IO: PgTransport>(sql: &str, io: IO) -> Result<CopyOut<'_, IO>> {
    span!("copy_out");
    let mut copy = CopyOut {
        io,
        sql,
        started: Instant::now(),
        rows: 0,
        error: None,
        done: false,
    };
    start(&mut copy.io, sql, Activity::CopyOut).await?;

    loop {
        use BackendMessage::*;
        match copy.io.recv().await {
            Ok(CopyOutResponse(_)) => break,
            Ok(CopyInResponse(_)) => {
                copy.done = true;
                let err = reject(&mut copy.io, "COPY FROM STDIN started as COPY TO STDOUT").await;
                return Err(end(&mut copy.io, sql, copy.started, err));
            }
            Ok(ReadyForQuery(_)) => {
                copy.done = true;
                let err = Error::conflict("statement is not COPY TO STDOUT");
                return Err(end(&mut copy.io, sql, copy.started, err));
            }
            Ok(_) => {}
            Err(err) => {
                copy.done = true;
                let err = match err.is_fatal() {
                    true => err,
                    false => drain(&mut copy.io, err).await,
                };
                return Err(end(&mut copy.io, sql, copy.started, err));
            }
        }
    }

    verbose!("copy out started");
    Ok(copy)
}

/// Copy rows into `table` using the binary format, returns the number of rows copied.
///
/// Every value is encoded by the binary codec registered for its [`Param`] oid.
///
/// ```no_run
/// use pgsession::codec::Param;
///
/// # async fn app(conn: &mut pgsession::Connection) -> pgsession::Result<()> {
/// let rows = vec![
///     vec![Param::new(1i32), Param::new("foo")],
///     vec![Param::new(2i32), Param::new("bar")],
/// ];
/// let copied = pgsession::copy::copy_from("public.post", &["id", "name"], rows, conn).await?;
/// assert_eq!(copied, 2);
/// # Ok(())
/// # }
/// ```
pub async fn copy_from<IO, I>(table: &str, columns: &[&str], rows: I, io: IO) -> Result<u64>
where
    IO: PgTransport,
    I: IntoIterator<Item = Vec<Param>>,
{
    let columns = columns.iter().map(|e| quote_ident(e)).collect::<Vec<_>>();
    let sql = match columns.is_empty() {
        true => format!("COPY {} FROM STDIN (FORMAT binary)", quote_qualified(table)),
        false => format!(
            "COPY {} ({}) FROM STDIN (FORMAT binary)",
            quote_qualified(table),
            columns.join(", "),
        ),
    };

    let mut copy = copy_in(&sql, io).await?;
    let registry = copy.io.session().registry.clone();
    let mut buf = BytesMut::with_capacity(FLUSH_THRESHOLD);
    let mut value = BytesMut::new();
    buf.put_slice(BINARY_HEADER);

    for row in rows {
        let Ok(len) = i16::try_from(row.len()) else {
            copy.abort("too many columns").await?;
            return Err(Error::config("copy row has more than 32767 values"));
        };
        buf.put_i16(len);
        for param in &row {
            let encoded = match param.encode_binary(&registry, &mut value) {
                Ok(encoded) => encoded,
                Err(err) => {
                    copy.abort("value encoding failed").await?;
                    return Err(err);
                }
            };
            match encoded {
                Some(bytes) => {
                    let Ok(len) = i32::try_from(bytes.len()) else {
                        copy.abort("value too large").await?;
                        return Err(Error::config("copy value larger than 2GiB"));
                    };
                    buf.put_i32(len);
                    buf.put_slice(&bytes);
                }
                None => buf.put_i32(-1),
            }
        }
        if buf.len() >= FLUSH_THRESHOLD {
            copy.send(&buf.split()).await?;
        }
    }

    buf.put_i16(-1);
    copy.send(&buf).await?;
    copy.finish().await
}

/// Write `Query` after the session is ready, marking it busy with `activity`.
async fn start<IO: PgTransport>(io: &mut IO, sql: &str, activity: Activity) -> Result<()> {
    io.ready().await?;
    let session = io.session();
    if session.tx_status == TxStatus::Failed {
        return Err(AbortedTransaction.into());
    }
    session.activity = Some(activity);
    if let Some(hooks) = session.hooks() {
        hooks.copy_start(sql);
    }
    io.send(frontend::Query { sql });
    io.flush().await?;
    Ok(())
}

/// Leave an unexpected copy mode, then drain to `ReadyForQuery`.
async fn reject<IO: PgTransport>(io: &mut IO, reason: &'static str) -> Error {
    io.ready_request();
    match io.ready().await {
        Ok(()) => Error::conflict(reason),
        Err(err) => err,
    }
}

/// Release the session after a failed copy and report it to hooks.
fn end<IO: PgTransport>(io: &mut IO, sql: &str, started: Instant, err: Error) -> Error {
    io.session().activity = None;
    if let Some(hooks) = io.session().hooks() {
        hooks.copy_end(sql, Err(&err), started.elapsed());
    }
    err
}

/// Read up to `ReadyForQuery` after a server error, returning the error to report.
async fn drain<IO: PgTransport>(io: &mut IO, err: Error) -> Error {
    loop {
        match io.recv::<BackendMessage>().await {
            Ok(BackendMessage::ReadyForQuery(_)) => return err,
            Ok(_) => {}
            Err(fatal) if fatal.is_fatal() => return fatal,
            Err(_) => {}
        }
    }
}

/// An open `COPY FROM STDIN`.
#[derive(Debug)]
#[must_use = "copy is aborted unless finished"]
pub struct CopyIn<'a, IO: PgTransport> {
    io: IO,
    sql: &'a str,
    started: Instant,
    unflushed: usize,
    done: bool,
}

impl<IO: PgTransport> CopyIn<'_, IO> {
    /// Send a chunk of data, chunks need not be aligned to rows.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        for data in data.chunks(MAX_COPY_DATA) {
            self.io.send(frontend::CopyData { data });
            self.unflushed += data.len();
            if self.unflushed >= FLUSH_THRESHOLD {
                self.io.flush().await?;
                self.unflushed = 0;
            }
        }
        Ok(())
    }

    /// Complete the copy, returns the number of rows copied.
    pub async fn finish(mut self) -> Result<u64> {
        self.io.send(frontend::CopyDone);
        let result = self.complete().await;
        self.done = true;
        self.io.session().activity = None;
        if let Some(hooks) = self.io.session().hooks() {
            hooks.copy_end(self.sql, result.as_ref().copied(), self.started.elapsed());
        }
        result
    }

    /// Abort the copy, the server rolls back every row sent so far.
    pub async fn abort(mut self, reason: &str) -> Result<()> {
        self.io.send(frontend::CopyFail { reason });
        let result = match self.complete().await {
            Ok(_) => Ok(()),
            // the error answering CopyFail
            Err(err) if !err.is_fatal() => Ok(()),
            Err(err) => Err(err),
        };
        self.done = true;
        end(&mut self.io, self.sql, self.started, Error::cancelled());
        verbose!("copy in aborted");
        result
    }

    async fn complete(&mut self) -> Result<u64> {
        self.io.flush().await?;
        let mut tag = CommandTag::empty();
        loop {
            match self.io.recv::<BackendMessage>().await {
                Ok(BackendMessage::CommandComplete(cmd)) => tag = CommandTag::new(cmd.tag),
                Ok(BackendMessage::ReadyForQuery(_)) => return Ok(tag.rows_affected()),
                Ok(f) => return Err(f.unexpected("copy in completion").into()),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => return Err(drain(&mut self.io, err).await),
            }
        }
    }

    async fn fail(&mut self, err: Error) -> Error {
        let err = match err.is_fatal() {
            true => err,
            false => drain(&mut self.io, err).await,
        };
        end(&mut self.io, self.sql, self.started, err)
    }
}

impl<IO: PgTransport> Drop for CopyIn<'_, IO> {
    fn drop(&mut self) {
        if !self.done {
            verbose!("copy in abandoned");
            self.io.ready_request();
        }
    }
}

/// An open `COPY TO STDOUT`, a stream of data chunks.
#[derive(Debug)]
#[must_use = "streams do nothing unless polled"]
pub struct CopyOut<'a, IO: PgTransport> {
    io: IO,
    sql: &'a str,
    started: Instant,
    rows: u64,
    error: Option<Error>,
    done: bool,
}

impl<IO: PgTransport> CopyOut<'_, IO> {
    /// Next data chunk, usually one row.
    pub async fn next(&mut self) -> Option<Result<Bytes>> {
        poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    /// Discard remaining data and return the number of rows copied.
    pub async fn finish(mut self) -> Result<u64> {
        let mut error = None;
        while let Some(chunk) = self.next().await {
            if let Err(err) = chunk {
                error.get_or_insert(err);
            }
        }
        match error {
            Some(err) => Err(err),
            None => Ok(self.rows),
        }
    }

    fn close(&mut self, result: Result<u64, &Error>) {
        self.done = true;
        self.io.session().activity = None;
        if let Some(hooks) = self.io.session().hooks() {
            hooks.copy_end(self.sql, result, self.started.elapsed());
        }
    }
}

impl<IO: PgTransport> Stream for CopyOut<'_, IO> {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();
        loop {
            if me.done {
                return Poll::Ready(None);
            }
            match ready!(me.io.poll_recv::<BackendMessage>(cx)) {
                Ok(BackendMessage::CopyData(data)) if me.error.is_none() => {
                    return Poll::Ready(Some(Ok(data.data)));
                }
                Ok(BackendMessage::CommandComplete(cmd)) => {
                    me.rows = CommandTag::new(cmd.tag).rows_affected();
                }
                Ok(BackendMessage::ReadyForQuery(_)) => match me.error.take() {
                    Some(err) => {
                        me.close(Err(&err));
                        return Poll::Ready(Some(Err(err)));
                    }
                    None => {
                        me.close(Ok(me.rows));
                        return Poll::Ready(None);
                    }
                },
                Ok(BackendMessage::CopyDone(_)) | Ok(BackendMessage::CopyData(_)) => {}
                Ok(f) => {
                    me.io.session().broken = true;
                    let err = Error::from(f.unexpected("copy out"));
                    me.close(Err(&err));
                    return Poll::Ready(Some(Err(err)));
                }
                Err(err) if err.is_fatal() => {
                    me.close(Err(&err));
                    return Poll::Ready(Some(Err(err)));
                }
                // reported after ReadyForQuery
                Err(err) => me.error = Some(err),
            }
        }
    }
}

impl<IO: PgTransport> Drop for CopyOut<'_, IO> {
    fn drop(&mut self) {
        if !self.done {
            verbose!("copy out abandoned");
            self.io.ready_request();
        }
    }
}
