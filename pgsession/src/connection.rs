//! Postgres connection.
//!
//! A [`Connection`] owns the socket and the [`SessionState`], it demultiplexes asynchronous
//! messages out of the reply stream and keeps track of how many `ReadyForQuery` are still
//! owed by the server, so an operation dropped halfway is drained before the next one starts.
use bytes::Bytes;
use std::{
    future::poll_fn,
    io,
    task::{Context, Poll, ready},
};

use crate::{
    Error, Result,
    common::{span, verbose, warn_log},
    net::Target,
    postgres::{
        BackendProtocol, FrontendProtocol, ProtocolError,
        backend::{self, BackendMessage},
        frontend,
    },
    stream::PgStream,
    transport::PgTransport,
};

mod auth;
mod cancel;
mod config;
mod startup;
mod state;

pub use auth::{AuthError, ScramSha256, UnsupportedAuth, md5};
pub use cancel::CancelToken;
pub use config::{Config, ConfigError, SslMode, TlsOptions};
pub use state::{Notification, SessionState, TxStatus};

pub(crate) use state::Activity;

#[cfg(test)]
pub(crate) use auth::{hi, hmac};

/// Reason sent with `CopyFail` when a copy is abandoned.
const COPY_ABANDONED: &str = "copy abandoned by client";

/// Where to send `CancelRequest`.
#[derive(Debug, Clone)]
struct CancelTarget {
    target: Target,
    host: String,
    tls: TlsOptions,
}

/// Single postgres session.
///
/// All operations take the connection by `&mut`, one operation owns the session at a time.
#[derive(Debug)]
pub struct Connection {
    stream: PgStream,
    state: SessionState,
    cancel: CancelTarget,
    /// Extended query messages sent without a closing `Sync`.
    unsynced: bool,
    /// Server is in copy-in mode.
    copy_in: bool,
    /// Last command was sent using the simple query protocol.
    simple: bool,
}

impl Connection {
    /// Connect using [`Config::from_env`].
    pub async fn connect_env() -> Result<Self> {
        Self::connect(&Config::from_env()).await
    }

    /// Open a session, performing tls negotiation, authentication and parameter exchange.
    ///
    /// Fails with [`Timeout`][crate::error::Timeout] when [`Config::connect_timeout`] elapsed.
    pub async fn connect(config: &Config) -> Result<Self> {
        match config.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, startup::startup(config))
                .await
                .map_err(|_| Error::from(crate::error::Timeout))?,
            None => startup::startup(config).await,
        }
    }

    pub(crate) fn new(stream: PgStream, config: &Config) -> Self {
        Self {
            stream,
            state: SessionState::new(config),
            cancel: CancelTarget {
                target: config.target(),
                host: config.host.clone(),
                tls: config.tls.clone(),
            },
            unsynced: false,
            copy_in: false,
            simple: false,
        }
    }

    /// Returns `true` if the session can run the next operation.
    ///
    /// Broken sessions, sessions still owned by a leaked operation, and sessions in a failed
    /// transaction block are not healthy.
    pub fn is_healthy(&self) -> bool {
        !self.state.broken && self.state.activity.is_none() && self.state.tx_status != TxStatus::Failed
    }

    /// Transaction status of the last `ReadyForQuery`.
    pub fn tx_status(&self) -> TxStatus {
        self.state.tx_status
    }

    /// Server reported run-time parameter, e.g. `server_version`.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.state.parameter(name)
    }

    /// Backend process id.
    pub fn process_id(&self) -> Option<u32> {
        self.state.key.map(|e| e.process_id)
    }

    /// Returns `true` if the session runs over tls.
    pub fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    /// Handle to cancel a running query from another task.
    ///
    /// Returns [`None`] if the server never sent its cancellation key.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        let key = self.state.key?;
        Some(CancelToken::new(
            self.cancel.target.clone(),
            self.cancel.host.clone(),
            self.cancel.tls.clone(),
            key,
        ))
    }

    /// Drain replies of abandoned operations, so the next one starts on a clean stream.
    pub async fn ready(&mut self) -> Result<()> {
        poll_fn(|cx| PgTransport::poll_ready(self, cx)).await
    }

    /// Gracefully close the session.
    pub async fn close(mut self) -> Result<()> {
        span!("close");
        if !self.state.broken {
            self.stream.send(frontend::Terminate);
            poll_fn(|cx| self.stream.poll_flush(cx)).await?;
        }
        self.state.broken = true;
        verbose!("session closed");
        poll_fn(|cx| self.stream.poll_shutdown(cx)).await?;
        Ok(())
    }

    pub(crate) fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }

    /// Poll for a notification, reading the socket while the session is idle.
    pub(crate) fn poll_notification(&mut self, cx: &mut Context) -> Poll<Result<Notification>> {
        loop {
            if let Some(notification) = self.state.notifications.pop_front() {
                return Poll::Ready(Ok(notification));
            }

            ready!(PgTransport::poll_ready(self, cx))?;

            if let Some(notification) = self.state.notifications.pop_front() {
                return Poll::Ready(Ok(notification));
            }

            let (msgtype, body) = ready!(self.poll_frame(cx))?;
            if let Some((msgtype, _)) = self.dispatch(msgtype, body)? {
                self.state.broken = true;
                let err = ProtocolError::unexpected_phase(msgtype, "waiting for notification");
                return Poll::Ready(Err(err.into()));
            }
        }
    }

    fn poll_frame(&mut self, cx: &mut Context) -> Poll<Result<(u8, Bytes)>> {
        if self.stream.has_pending_write() {
            ready!(PgTransport::poll_flush(self, cx))?;
        }
        let result = ready!(self.stream.poll_frame(cx));
        if result.is_err() {
            self.state.broken = true;
        }
        Poll::Ready(result)
    }

    /// Consume asynchronous messages and keep session bookkeeping.
    ///
    /// Returns [`None`] when the message was consumed.
    fn dispatch(&mut self, msgtype: u8, body: Bytes) -> Result<Option<(u8, Bytes)>> {
        let result = self.dispatch_inner(msgtype, body);
        if let Err(err) = &result {
            if err.is_fatal() {
                self.state.broken = true;
            }
        }
        result
    }

    fn dispatch_inner(&mut self, msgtype: u8, body: Bytes) -> Result<Option<(u8, Bytes)>> {
        use backend::*;

        verbose!(msgtype = %BackendMessage::message_name(msgtype), "recv");

        match msgtype {
            NotificationResponse::MSGTYPE => {
                let msg = NotificationResponse::decode(msgtype, body)?;
                self.state.notifications.push_back(Notification::new(
                    msg.process_id,
                    msg.channel,
                    msg.payload,
                ));
                Ok(None)
            }
            NoticeResponse::MSGTYPE => {
                let _notice = NoticeResponse::decode(msgtype, body)?.to_database_error()?;
                warn_log!("{_notice}");
                Ok(None)
            }
            ParameterStatus::MSGTYPE => {
                let param = ParameterStatus::decode(msgtype, body)?;
                self.state.parameters.insert(param.name, param.value);
                Ok(None)
            }
            ErrorResponse::MSGTYPE => {
                // server leaves copy-in mode on error
                self.copy_in = false;
                let err = ErrorResponse::decode(msgtype, body)?.to_database_error()?;
                Err(err.into())
            }
            ReadyForQuery::MSGTYPE => {
                let ready = ReadyForQuery::decode(msgtype, body.clone())?;
                self.state.tx_status = state::TxStatus::from_byte(ready.tx_status)?;
                self.state.pending_ready = self
                    .state
                    .pending_ready
                    .checked_sub(1)
                    .ok_or(ProtocolError::unexpected_phase(msgtype, "no pending sync"))?;
                self.copy_in = false;
                Ok(Some((msgtype, body)))
            }
            CopyInResponse::MSGTYPE => {
                self.copy_in = true;
                if !self.simple {
                    // backend ignores Sync in copy-in mode, assume the one already sent is lost
                    if !self.unsynced {
                        self.state.pending_ready = self.state.pending_ready.saturating_sub(1);
                    }
                    self.unsynced = true;
                }
                Ok(Some((msgtype, body)))
            }
            _ => Ok(Some((msgtype, body))),
        }
    }
}

impl PgTransport for Connection {
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        let result = ready!(self.stream.poll_flush(cx));
        if result.is_err() {
            self.state.broken = true;
        }
        Poll::Ready(result)
    }

    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        loop {
            let (msgtype, body) = ready!(self.poll_frame(cx))?;
            let Some((msgtype, body)) = self.dispatch(msgtype, body)? else {
                continue;
            };
            return Poll::Ready(B::decode(msgtype, body).map_err(|err| {
                self.state.broken = true;
                err.into()
            }));
        }
    }

    fn poll_ready(&mut self, cx: &mut Context) -> Poll<Result<()>> {
        if self.state.broken {
            return Poll::Ready(Err(Error::closed()));
        }
        if let Some(activity) = self.state.activity {
            return Poll::Ready(Err(Error::conflict(activity.busy_reason())));
        }

        loop {
            if self.copy_in {
                self.send(frontend::CopyFail { reason: COPY_ABANDONED });
            }
            if self.unsynced {
                self.send(frontend::Sync);
            }
            if self.state.pending_ready == 0 {
                break;
            }
            match ready!(self.poll_recv::<BackendMessage>(cx)) {
                Ok(_) => {}
                Err(err) if err.is_fatal() => return Poll::Ready(Err(err)),
                // belongs to the abandoned operation
                Err(_) => {}
            }
        }

        if self.stream.has_pending_write() {
            ready!(PgTransport::poll_flush(self, cx))?;
        }
        Poll::Ready(Ok(()))
    }

    fn ready_request(&mut self) {
        if self.state.activity.take().is_some() {
            verbose!(pending = self.state.pending_ready, "resync requested");
        }
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        if self.copy_in && !matches!(F::MSGTYPE, b'd' | b'c' | b'f') {
            self.copy_in = false;
            self.stream.send(frontend::CopyFail { reason: COPY_ABANDONED });
        }

        match F::MSGTYPE {
            b'Q' => {
                if self.unsynced {
                    self.stream.send(frontend::Sync);
                    self.state.pending_ready += 1;
                    self.unsynced = false;
                }
                self.state.pending_ready += 1;
                self.simple = true;
            }
            b'S' => {
                self.state.pending_ready += 1;
                self.unsynced = false;
            }
            b'P' | b'B' | b'D' | b'E' | b'C' => {
                self.unsynced = true;
                self.simple = false;
            }
            b'c' | b'f' => self.copy_in = false,
            _ => {}
        }

        verbose!(msgtype = %(F::MSGTYPE as char), "send");
        self.stream.send(message);
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        self.state.pending_ready = 1;
        self.stream.send_startup(startup);
    }

    fn session(&mut self) -> &mut SessionState {
        &mut self.state
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::{
        error::ErrorKind,
        execute,
        postgres::oid,
        testing::{Auth, MockServer, PROCESS_ID, Reply},
    };

    fn responder(sql: &str, _: &[Option<String>]) -> Reply {
        match sql {
            "SELECT pg_sleep(10)" => Reply::Sleep,
            "SELECT 'a\\b'" => Reply::Notice(
                "nonstandard use of \\\\ in a string literal",
                Box::new(Reply::Rows(vec![("?column?", oid::TEXT)], vec![vec![Some("a\\b".into())]])),
            ),
            _ => Reply::int(1),
        }
    }

    async fn select_one(conn: &mut Connection) -> i32 {
        crate::query::<_, _, (i32,)>("SELECT 1", conn).fetch_one().await.unwrap().0
    }

    #[tokio::test]
    async fn supported_authentication() {
        for auth in [Auth::Trust, Auth::Cleartext, Auth::Md5, Auth::Scram] {
            let mock = MockServer::with_auth(auth, responder).await;
            let mut conn = mock.connect().await;

            assert_eq!(conn.parameter("server_version"), Some("16.0"));
            assert_eq!(conn.parameter("client_encoding"), Some("UTF8"));
            assert_eq!(conn.parameter("TimeZone"), None);
            assert_eq!(conn.process_id(), Some(PROCESS_ID));
            assert_eq!(conn.tx_status(), TxStatus::Idle);
            assert!(conn.is_healthy());
            assert!(!conn.is_tls());
            assert_eq!(select_one(&mut conn).await, 1);

            conn.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn negotiated_protocol_version() {
        for auth in [Auth::Trust, Auth::Md5] {
            let mock = MockServer::with_auth(auth, responder).await;
            mock.negotiate_protocol();
            let mut conn = mock.connect().await;

            assert_eq!(conn.process_id(), Some(PROCESS_ID));
            assert_eq!(select_one(&mut conn).await, 1);
        }
    }

    #[tokio::test]
    async fn notice_is_not_an_error() {
        let mock = MockServer::start(responder).await;
        let mut conn = mock.connect().await;

        let (value,) = crate::query::<_, _, (String,)>("SELECT 'a\\b'", &mut conn)
            .fetch_one()
            .await
            .unwrap();
        assert_eq!(value, "a\\b");

        let results = crate::query::simple_query("SELECT 'a\\b'", &mut conn).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(conn.is_healthy());
    }

    #[tokio::test]
    async fn wrong_password() {
        for auth in [Auth::Cleartext, Auth::Md5, Auth::Scram] {
            let mock = MockServer::with_auth(auth, responder).await;
            let config = mock.config().password("hunter2");
            let err = Connection::connect(&config).await.unwrap_err();
            assert_eq!(err.code(), Some("28P01"), "{auth:?}");
            assert!(err.is_fatal());
        }
    }

    #[tokio::test]
    async fn unsupported_authentication() {
        for auth in [Auth::Kerberos, Auth::OAuth] {
            let mock = MockServer::with_auth(auth, responder).await;
            let err = Connection::connect(&mock.config()).await.unwrap_err();
            assert!(matches!(err.kind(), ErrorKind::UnsupportedAuth(_)), "{auth:?}: {err}");
        }
    }

    #[tokio::test]
    async fn connect_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let config = Config::new()
            .host("127.0.0.1")
            .port(port)
            .user("postgres")
            .ssl_mode(SslMode::Disable)
            .connect_timeout(Duration::from_millis(100));
        let err = Connection::connect(&config).await.unwrap_err();
        assert!(err.is_timeout());
        hold.abort();
    }

    #[tokio::test]
    async fn cancel_running_statement() {
        let mock = MockServer::start(responder).await;
        let mut conn = mock.connect().await;

        let token = conn.cancel_token().unwrap();
        assert_eq!(token.process_id(), PROCESS_ID);
        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel().await
        });

        let err = execute("SELECT pg_sleep(10)", &mut conn).await.unwrap_err();
        assert_eq!(err.code(), Some("57014"));
        cancel.await.unwrap().unwrap();

        assert!(conn.is_healthy());
        assert_eq!(select_one(&mut conn).await, 1);
    }

    #[tokio::test]
    async fn ready_on_idle_session() {
        let mock = MockServer::start(responder).await;
        let mut conn = mock.connect().await;

        conn.ready().await.unwrap();
        conn.ready().await.unwrap();
        assert_eq!(select_one(&mut conn).await, 1);
        assert!(conn.take_notification().is_none());
    }
}
