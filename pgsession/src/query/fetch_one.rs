use std::{
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll, ready},
};

use super::{Event, Running};
use crate::{Error, Result, Row, row::{FromRow, RowNotFound}, transport::PgTransport};

/// Returned [`fetch_optional`][super::Query::fetch_optional] future.
///
/// Only the first row is decoded, the rest is read and discarded.
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct FetchOptional<'a, IO: PgTransport, R> {
    running: Running<'a, IO>,
    row: Option<Row>,
    error: Option<Error>,
    _p: PhantomData<fn() -> R>,
}

impl<'a, IO: PgTransport, R> FetchOptional<'a, IO, R> {
    pub(crate) fn new(running: Running<'a, IO>) -> Self {
        Self { running, row: None, error: None, _p: PhantomData }
    }
}

impl<IO: PgTransport, R: FromRow + Unpin> Future for FetchOptional<'_, IO, R> {
    type Output = Result<Option<R>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let me = self.get_mut();

        while let Some(event) = ready!(me.running.poll_event(cx)) {
            match event {
                Event::Row(_, row) => {
                    if me.row.is_none() {
                        me.row = Some(row);
                    }
                }
                Event::Complete(..) => {}
                Event::Failed(_, err) => {
                    me.error.get_or_insert(err);
                }
            }
        }

        if let Some(err) = me.error.take() {
            return Poll::Ready(Err(err));
        }
        match me.row.take() {
            Some(row) => Poll::Ready(R::from_row(row).map(Some).map_err(Into::into)),
            None => Poll::Ready(Ok(None)),
        }
    }
}

/// Returned [`fetch_one`][super::Query::fetch_one] future.
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct FetchOne<'a, IO: PgTransport, R> {
    fetch: FetchOptional<'a, IO, R>,
}

impl<'a, IO: PgTransport, R> FetchOne<'a, IO, R> {
    pub(crate) fn new(running: Running<'a, IO>) -> Self {
        Self { fetch: FetchOptional::new(running) }
    }
}

impl<IO: PgTransport, R: FromRow + Unpin> Future for FetchOne<'_, IO, R> {
    type Output = Result<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match ready!(Pin::new(&mut self.get_mut().fetch).poll(cx)?) {
            Some(row) => Poll::Ready(Ok(row)),
            None => Poll::Ready(Err(RowNotFound.into())),
        }
    }
}
