//! `LISTEN` / `NOTIFY` support.
//!
//! Notifications are collected whenever the session reads from the server, including in the
//! middle of an unrelated query, and are handed out in arrival order.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! # async fn app(conn: &mut pgsession::Connection) -> pgsession::Result<()> {
//! pgsession::notify::listen("jobs", &mut *conn).await?;
//!
//! match conn.wait_for_notification(Some(Duration::from_secs(5))).await {
//!     Ok(n) => println!("{}: {}", n.channel(), n.payload()),
//!     Err(err) if err.is_timeout() => println!("nothing yet"),
//!     Err(err) => return Err(err),
//! }
//! # Ok(())
//! # }
//! ```
use pin_project_lite::pin_project;
use std::{
    future::poll_fn,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use crate::{
    Connection, Error, Result,
    connection::Notification,
    error::Timeout,
    query::Running,
    sql::quote_ident,
    transport::PgTransport,
};

impl Connection {
    /// Pop a notification already received, without reading the socket.
    pub fn take_notification(&mut self) -> Option<Notification> {
        self.state_mut().notifications.pop_front()
    }

    /// Wait for the next notification.
    ///
    /// With a `timeout`, fails with [`Timeout`] once it elapsed. The session stays usable.
    pub async fn wait_for_notification(&mut self, timeout: Option<Duration>) -> Result<Notification> {
        let wait = poll_fn(|cx| self.poll_notification(cx));
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait)
                .await
                .map_err(|_| Error::from(Timeout))?,
            None => wait.await,
        }
    }

    /// Wait for the next notification until `cancel` resolves.
    ///
    /// Fails with [`Cancelled`][crate::error::Cancelled] when `cancel` completes first. A
    /// notification already queued is returned even if `cancel` is ready.
    ///
    /// ```no_run
    /// # async fn app(conn: &mut pgsession::Connection) -> pgsession::Result<()> {
    /// let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    /// # drop(tx);
    /// let result = conn.wait_for_notification_or(rx).await;
    /// # Ok(())
    /// # }
    /// ```
    pub fn wait_for_notification_or<F: Future>(&mut self, cancel: F) -> WaitNotification<'_, F> {
        WaitNotification { conn: self, cancel }
    }
}

pin_project! {
    /// Returned [`Connection::wait_for_notification_or`] future.
    #[derive(Debug)]
    #[must_use = "futures do nothing unless you `.await` or poll them"]
    pub struct WaitNotification<'a, F> {
        conn: &'a mut Connection,
        #[pin]
        cancel: F,
    }
}

impl<F: Future> Future for WaitNotification<'_, F> {
    type Output = Result<Notification>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let me = self.project();
        if let Poll::Ready(result) = me.conn.poll_notification(cx) {
            return Poll::Ready(result);
        }
        match me.cancel.poll(cx) {
            Poll::Ready(_) => Poll::Ready(Err(Error::cancelled())),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Subscribe the session to `channel`.
pub async fn listen<IO: PgTransport>(channel: &str, mut io: IO) -> Result<()> {
    let sql = format!("LISTEN {}", quote_ident(channel));
    Running::simple(&mut io, &sql).finish().await?;
    Ok(())
}

/// Unsubscribe the session from `channel`.
pub async fn unlisten<IO: PgTransport>(channel: &str, mut io: IO) -> Result<()> {
    let sql = format!("UNLISTEN {}", quote_ident(channel));
    Running::simple(&mut io, &sql).finish().await?;
    Ok(())
}
