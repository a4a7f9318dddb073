use futures_core::Stream;
use std::{
    mem,
    pin::Pin,
    task::{Context, Poll, ready},
};

use super::{Event, RowStream, Running};
use crate::{Error, Result, row::FromRow, transport::PgTransport};

/// Returned [`fetch_all`][super::Query::fetch_all] future.
///
/// The first error is returned after the statement completed, so the session is never left
/// halfway through a reply.
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct FetchAll<'a, IO: PgTransport, R> {
    fetch: RowStream<'a, IO, R>,
    output: Vec<R>,
    error: Option<Error>,
}

impl<'a, IO: PgTransport, R> FetchAll<'a, IO, R> {
    pub(crate) fn new(fetch: RowStream<'a, IO, R>) -> Self {
        Self { fetch, output: vec![], error: None }
    }
}

impl<IO: PgTransport, R: FromRow + Unpin> Future for FetchAll<'_, IO, R> {
    type Output = Result<Vec<R>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let me = self.get_mut();
        let f = &mut me.fetch;

        while let Some(r) = ready!(Pin::new(&mut *f).poll_next(cx)) {
            match r {
                Ok(r) if me.error.is_none() => me.output.push(r),
                Ok(_) => {}
                Err(err) => {
                    me.error.get_or_insert(err);
                }
            }
        }

        match me.error.take() {
            Some(err) => Poll::Ready(Err(err)),
            None => Poll::Ready(Ok(mem::take(&mut me.output))),
        }
    }
}

/// Returned [`execute`][super::Query::execute] future, resolves to the number of rows affected.
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Execute<'a, IO: PgTransport> {
    running: Running<'a, IO>,
    rows_affected: u64,
    error: Option<Error>,
}

impl<'a, IO: PgTransport> Execute<'a, IO> {
    pub(crate) fn new(running: Running<'a, IO>) -> Self {
        Self { running, rows_affected: 0, error: None }
    }
}

impl<IO: PgTransport> Future for Execute<'_, IO> {
    type Output = Result<u64>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let me = self.get_mut();

        while let Some(event) = ready!(me.running.poll_event(cx)) {
            match event {
                Event::Row(..) => {}
                Event::Complete(_, tag) => me.rows_affected += tag.rows_affected(),
                Event::Failed(_, err) => {
                    me.error.get_or_insert(err);
                }
            }
        }

        match me.error.take() {
            Some(err) => Poll::Ready(Err(err)),
            None => Poll::Ready(Ok(me.rows_affected)),
        }
    }
}
