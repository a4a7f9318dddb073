//! The [`Transaction`] type.
use std::{
    fmt, io,
    task::{Context, Poll},
};

use crate::{
    Error, Result,
    common::{unit_error, verbose},
    connection::SessionState,
    postgres::{BackendProtocol, frontend::{self, FrontendProtocol}},
    query::Running,
    transport::PgTransport,
};

/// Begin a transaction, or a savepoint when `io` is already inside one.
///
/// The outermost frame issues `BEGIN`, a frame nested at depth `n` issues `SAVEPOINT sp_n`.
///
/// # Example
///
/// ```no_run
/// # async fn app(conn: &mut pgsession::Connection) -> pgsession::Result<()> {
/// let mut tx = pgsession::begin(conn).await?;
///
/// pgsession::execute("INSERT INTO post(name) VALUES ('foo')", &mut tx).await?;
///
/// let mut inner = pgsession::begin(&mut tx).await?;
/// if pgsession::execute("INSERT INTO post(id) VALUES (1)", &mut inner).await.is_err() {
///     inner.rollback().await?;
/// }
/// drop(inner);
///
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
pub async fn begin<IO: PgTransport>(io: IO) -> Result<Transaction<IO>> {
    begin_with(TxOptions::new(), io).await
}

/// Begin a transaction with the given isolation level and access mode.
///
/// Options only apply to the real transaction, beginning a nested frame with anything but the
/// default options fails with [`Conflict`][crate::ErrorKind::Conflict].
///
/// ```no_run
/// use pgsession::transaction::{IsolationLevel, TxOptions};
///
/// # async fn app(conn: &mut pgsession::Connection) -> pgsession::Result<()> {
/// let options = TxOptions::new().isolation(IsolationLevel::Serializable).read_only(true);
/// let mut tx = pgsession::begin_with(options, conn).await?;
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
pub async fn begin_with<IO: PgTransport>(options: TxOptions, mut io: IO) -> Result<Transaction<IO>> {
    let depth = io.session().depth;
    let sql = match depth {
        0 => format!("BEGIN{options}"),
        _ if !options.is_default() => {
            return Err(Error::conflict("transaction options on a nested frame"));
        }
        n => format!("SAVEPOINT sp_{n}"),
    };

    Running::simple(&mut io, &sql).finish().await?;
    io.session().depth = depth + 1;
    verbose!(depth, "transaction frame opened");

    Ok(Transaction { io, depth, open: true })
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    Serializable,
    RepeatableRead,
    ReadCommitted,
    ReadUncommitted,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Serializable => "SERIALIZABLE",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::ReadCommitted => "READ COMMITTED",
            Self::ReadUncommitted => "READ UNCOMMITTED",
        }
    }
}

/// Options of the `BEGIN` statement, the server defaults apply to anything unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    isolation: Option<IsolationLevel>,
    read_only: bool,
    deferrable: bool,
}

impl TxOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    /// `READ ONLY` access mode.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// `DEFERRABLE`, only meaningful for a serializable read only transaction.
    pub fn deferrable(mut self, deferrable: bool) -> Self {
        self.deferrable = deferrable;
        self
    }

    fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// Modes appended to `BEGIN`, each with a leading space.
impl fmt::Display for TxOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(level) = self.isolation {
            write!(f, " ISOLATION LEVEL {}", level.as_str())?;
        }
        if self.read_only {
            f.write_str(" READ ONLY")?;
        }
        if self.deferrable {
            f.write_str(" DEFERRABLE")?;
        }
        Ok(())
    }
}

/// An RAII transaction frame.
///
/// To commit the frame, use [`Transaction::commit`]. A frame dropped while still open is
/// rolled back, the rollback is sent with the next operation on the session.
#[derive(Debug)]
pub struct Transaction<IO: PgTransport> {
    io: IO,
    depth: usize,
    open: bool,
}

impl<IO: PgTransport> Transaction<IO> {
    /// Nesting level, `0` for the real transaction.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Commit the frame, `RELEASE SAVEPOINT` for a nested one.
    ///
    /// Fails with [`AbortedTransaction`] while the transaction is failed, the frame stays open
    /// and has to be rolled back.
    pub async fn commit(&mut self) -> Result<()> {
        if !self.open {
            return Err(TxClosed.into());
        }
        let sql = match self.depth {
            0 => String::from("COMMIT"),
            n => format!("RELEASE SAVEPOINT sp_{n}"),
        };

        let result = Running::simple(&mut self.io, &sql).finish().await;
        let closed = match &result {
            Ok(_) => true,
            // a failed COMMIT still ends the transaction
            Err(err) => self.depth == 0 && err.as_database().is_some(),
        };
        if closed {
            self.close();
        }

        match result?.as_str() {
            // server turns COMMIT of a failed transaction into ROLLBACK
            "ROLLBACK" => Err(AbortedTransaction.into()),
            _ => Ok(()),
        }
    }

    /// Roll back the frame, a no-op on a frame already closed.
    pub async fn rollback(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        let sql = rollback_sql(self.depth);
        let result = Running::simple(&mut self.io, &sql).finish().await;
        self.close();
        result.map(drop)
    }

    fn close(&mut self) {
        self.open = false;
        self.io.session().depth = self.depth;
        verbose!(depth = self.depth, "transaction frame closed");
    }
}

fn rollback_sql(depth: usize) -> String {
    match depth {
        0 => String::from("ROLLBACK"),
        n => format!("ROLLBACK TO SAVEPOINT sp_{n}; RELEASE SAVEPOINT sp_{n}"),
    }
}

impl<IO: PgTransport> Drop for Transaction<IO> {
    fn drop(&mut self) {
        if !self.open || self.io.session().broken {
            return;
        }
        let sql = rollback_sql(self.depth);
        self.io.send(frontend::Query { sql: &sql });
        self.close();
    }
}

impl<IO: PgTransport> PgTransport for Transaction<IO> {
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        IO::poll_flush(&mut self.io, cx)
    }

    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        IO::poll_recv(&mut self.io, cx)
    }

    fn poll_ready(&mut self, cx: &mut Context) -> Poll<Result<()>> {
        if !self.open {
            return Poll::Ready(Err(Error::from(TxClosed)));
        }
        IO::poll_ready(&mut self.io, cx)
    }

    fn ready_request(&mut self) {
        IO::ready_request(&mut self.io)
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        IO::send(&mut self.io, message)
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        IO::send_startup(&mut self.io, startup)
    }

    fn session(&mut self) -> &mut SessionState {
        IO::session(&mut self.io)
    }
}

unit_error! {
    /// Statement issued in a failed transaction block, only rollback is accepted.
    pub struct AbortedTransaction("current transaction is aborted, commands ignored until end of transaction block");
}

unit_error! {
    /// Operation on a transaction frame that was already committed or rolled back.
    pub struct TxClosed("transaction already closed");
}
