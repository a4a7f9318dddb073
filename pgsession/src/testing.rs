//! Scripted backend speaking the wire protocol over a local tcp socket.
//!
//! The mock keeps just enough server state to answer like postgres does: named statements,
//! the unnamed portal, transaction status with savepoints, copy-in mode, and the skip-until-Sync
//! rule after an error. Statements outside the transaction commands are answered by a
//! [`Responder`] supplied by the test.
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::Notify,
};

use crate::{
    Connection,
    connection::{Config, SslMode, hi, hmac, md5},
    postgres::{Oid, oid},
};

pub(crate) const PASSWORD: &str = "secret";
pub(crate) const PROCESS_ID: u32 = 42;
const SECRET_KEY: u32 = 7;
const SALT: &str = "W22ZaJ0SNY7soEsUEjb6gQ==";
const ITERATIONS: u32 = 4096;

/// Words the mock accepts as the start of a statement, anything else is a syntax error.
const KEYWORDS: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "BEGIN", "COMMIT", "ROLLBACK", "ABORT", "SAVEPOINT",
    "RELEASE", "LISTEN", "UNLISTEN", "NOTIFY", "COPY", "CREATE", "DROP", "SET", "SHOW", "VALUES",
];

/// Authentication requested by the mock.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Auth {
    Trust,
    Cleartext,
    Md5,
    Scram,
    Kerberos,
    /// SASL without any mechanism the client implements.
    OAuth,
}

/// Answer for one statement.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Rows(Vec<(&'static str, Oid)>, Vec<Vec<Option<String>>>),
    Command(String),
    Error(&'static str, String),
    Empty,
    /// Enter copy-in mode, completion reports one row per line, or per tuple of binary data.
    CopyIn,
    CopyOut(Vec<&'static str>),
    /// Send the notifications, then the inner reply.
    Notify(Vec<(&'static str, &'static str)>, Box<Reply>),
    /// Send a warning `NoticeResponse`, then the inner reply.
    Notice(&'static str, Box<Reply>),
    /// Reply `NOTIFY`, then deliver a notification once the session went idle.
    NotifyLater(Duration, &'static str, &'static str),
    /// Block until a matching `CancelRequest` arrives, then fail with `57014`.
    Sleep,
}

impl Reply {
    pub(crate) fn int(value: i32) -> Reply {
        Reply::Rows(vec![("?column?", oid::INT4)], vec![vec![Some(value.to_string())]])
    }

    pub(crate) fn ints(name: &'static str, values: impl IntoIterator<Item = i32>) -> Reply {
        let rows = values.into_iter().map(|v| vec![Some(v.to_string())]).collect();
        Reply::Rows(vec![(name, oid::INT4)], rows)
    }

    pub(crate) fn command(tag: &str) -> Reply {
        Reply::Command(tag.to_owned())
    }

    pub(crate) fn error(code: &'static str, message: &str) -> Reply {
        Reply::Error(code, message.to_owned())
    }
}

/// Answers statements, given the sql and the parameters rendered as text.
pub(crate) type Responder = Arc<dyn Fn(&str, &[Option<String>]) -> Reply + Send + Sync>;

struct Shared {
    auth: Auth,
    responder: Responder,
    /// Frontend message types in arrival order, with the sql of `Parse` and `Query`.
    log: Mutex<Vec<(u8, String)>>,
    cancel: Notify,
    forget: AtomicBool,
    negotiate: AtomicBool,
}

/// Handle to a running mock backend.
pub(crate) struct MockServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl MockServer {
    pub(crate) async fn start(responder: impl Fn(&str, &[Option<String>]) -> Reply + Send + Sync + 'static) -> MockServer {
        Self::with_auth(Auth::Trust, responder).await
    }

    pub(crate) async fn with_auth(
        auth: Auth,
        responder: impl Fn(&str, &[Option<String>]) -> Reply + Send + Sync + 'static,
    ) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            auth,
            responder: Arc::new(responder),
            log: Mutex::new(Vec::new()),
            cancel: Notify::new(),
            forget: AtomicBool::new(false),
            negotiate: AtomicBool::new(false),
        });

        let accept = shared.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let shared = accept.clone();
                tokio::spawn(async move {
                    let _ = Session::new(stream, shared).run().await;
                });
            }
        });

        MockServer { addr, shared }
    }

    pub(crate) fn config(&self) -> Config {
        Config::new()
            .host("127.0.0.1")
            .port(self.addr.port())
            .user("postgres")
            .password(PASSWORD)
            .ssl_mode(SslMode::Disable)
    }

    pub(crate) async fn connect(&self) -> Connection {
        Connection::connect(&self.config()).await.unwrap()
    }

    /// Number of frontend messages of type `msgtype` received so far.
    pub(crate) fn count(&self, msgtype: u8) -> usize {
        self.shared.log.lock().unwrap().iter().filter(|(ty, _)| *ty == msgtype).count()
    }

    /// Sql text of every `Parse` received.
    pub(crate) fn parsed(&self) -> Vec<String> {
        self.shared
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|(ty, _)| *ty == b'P')
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    /// Sql text of every `Query` received.
    pub(crate) fn queries(&self) -> Vec<String> {
        self.shared
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|(ty, _)| *ty == b'Q')
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    /// Answer the next startup with `NegotiateProtocolVersion`, as a server lacking the requested
    /// minor version and the `_pq_` options does.
    pub(crate) fn negotiate_protocol(&self) {
        self.shared.negotiate.store(true, Ordering::SeqCst);
    }

    /// Deallocate every prepared statement, as `DISCARD ALL` from another client would.
    pub(crate) fn forget_statements(&self) {
        self.shared.forget.store(true, Ordering::SeqCst);
    }
}

struct Statement {
    oids: Vec<Oid>,
    sql: String,
}

struct Portal {
    sql: String,
    params: Vec<Option<String>>,
    formats: Vec<i16>,
    reply: Option<Reply>,
    sent: usize,
}

struct CopyIn {
    data: Vec<u8>,
    simple: bool,
}

struct Session {
    stream: TcpStream,
    out: BytesMut,
    shared: Arc<Shared>,
    statements: HashMap<String, Statement>,
    portal: Option<Portal>,
    tx: u8,
    savepoints: Vec<String>,
    skip: bool,
    copy: Option<CopyIn>,
    later: Option<(Duration, &'static str, &'static str)>,
}

impl Session {
    fn new(stream: TcpStream, shared: Arc<Shared>) -> Self {
        Self {
            stream,
            out: BytesMut::new(),
            shared,
            statements: HashMap::new(),
            portal: None,
            tx: b'I',
            savepoints: Vec::new(),
            skip: false,
            copy: None,
            later: None,
        }
    }

    async fn run(mut self) -> std::io::Result<()> {
        if !self.startup().await? {
            return Ok(());
        }

        loop {
            let (msgtype, mut body) = self.read_frame().await?;
            let logged = match msgtype {
                b'Q' => cstr(&mut body.clone()),
                b'P' => {
                    let mut peek = body.clone();
                    cstr(&mut peek);
                    cstr(&mut peek)
                }
                _ => String::new(),
            };
            self.shared.log.lock().unwrap().push((msgtype, logged));
            if self.shared.forget.swap(false, Ordering::SeqCst) {
                self.statements.clear();
            }

            if msgtype == b'X' {
                return Ok(());
            }

            if self.copy.is_some() {
                self.copy_message(msgtype, body);
            } else if self.skip && msgtype != b'S' {
                // skipped until Sync
            } else {
                match msgtype {
                    b'P' => self.parse(&mut body),
                    b'B' => self.bind(&mut body),
                    b'D' => self.describe(&mut body),
                    b'E' => self.execute(&mut body).await,
                    b'C' => self.close(&mut body),
                    b'S' => {
                        self.skip = false;
                        self.portal = None;
                        self.ready();
                    }
                    b'Q' => self.query(&mut body).await,
                    // outside copy mode these are ignored
                    b'H' | b'd' | b'c' | b'f' => {}
                    _ => {
                        self.error("08P01", &format!("invalid frontend message type {msgtype}"));
                        self.flush().await?;
                        return Ok(());
                    }
                }
            }

            self.flush().await?;

            if let Some((delay, channel, payload)) = self.later.take() {
                tokio::time::sleep(delay).await;
                self.notification(channel, payload);
                self.flush().await?;
            }
        }
    }

    // ===== Startup =====

    async fn startup(&mut self) -> std::io::Result<bool> {
        loop {
            let len = self.stream.read_i32().await?;
            let code = self.stream.read_i32().await?;
            let mut body = vec![0; len as usize - 8];
            self.stream.read_exact(&mut body).await?;
            match code {
                80877103 => {
                    self.stream.write_all(b"N").await?;
                }
                80877102 => {
                    let mut body = Bytes::from(body);
                    self.shared.log.lock().unwrap().push((b'!', String::new()));
                    if body.get_u32() == PROCESS_ID && body.get_u32() == SECRET_KEY {
                        self.shared.cancel.notify_one();
                    }
                    return Ok(false);
                }
                _ => break,
            }
        }

        if self.shared.negotiate.swap(false, Ordering::SeqCst) {
            self.message(b'v', |b| {
                b.put_u32(0);
                b.put_u32(1);
                put_cstr(b, "_pq_.compression");
            });
        }

        if !self.authenticate().await? {
            return Ok(false);
        }

        self.message(b'R', |b| b.put_u32(0));
        self.parameter_status("server_version", "16.0");
        self.parameter_status("client_encoding", "UTF8");
        self.message(b'K', |b| {
            b.put_u32(PROCESS_ID);
            b.put_u32(SECRET_KEY);
        });
        self.ready();
        self.flush().await?;
        Ok(true)
    }

    async fn authenticate(&mut self) -> std::io::Result<bool> {
        let accepted = match self.shared.auth {
            Auth::Trust => true,
            Auth::Cleartext => {
                self.message(b'R', |b| b.put_u32(3));
                self.flush().await?;
                let (_, mut body) = self.read_frame().await?;
                cstr(&mut body) == PASSWORD
            }
            Auth::Md5 => {
                let salt = [1, 2, 3, 4];
                self.message(b'R', |b| {
                    b.put_u32(5);
                    b.put_slice(&salt);
                });
                self.flush().await?;
                let (_, mut body) = self.read_frame().await?;
                cstr(&mut body) == md5("postgres", PASSWORD, salt)
            }
            Auth::Scram => self.scram().await?,
            Auth::Kerberos => {
                self.message(b'R', |b| b.put_u32(2));
                self.flush().await?;
                return Ok(false);
            }
            Auth::OAuth => {
                self.message(b'R', |b| {
                    b.put_u32(10);
                    b.put_slice(b"OAUTHBEARER\0\0");
                });
                self.flush().await?;
                return Ok(false);
            }
        };

        if !accepted {
            self.message(b'E', |b| {
                put_field(b, b'S', "FATAL");
                put_field(b, b'V', "FATAL");
                put_field(b, b'C', "28P01");
                put_field(b, b'M', "password authentication failed for user \"postgres\"");
                b.put_u8(0);
            });
            self.flush().await?;
        }
        Ok(accepted)
    }

    async fn scram(&mut self) -> std::io::Result<bool> {
        self.message(b'R', |b| {
            b.put_u32(10);
            b.put_slice(b"SCRAM-SHA-256\0\0");
        });
        self.flush().await?;

        let (_, mut body) = self.read_frame().await?;
        let mechanism = cstr(&mut body);
        let len = body.get_i32() as usize;
        let client_first = String::from_utf8_lossy(&body[..len]).into_owned();
        assert_eq!(mechanism, "SCRAM-SHA-256");

        let client_first_bare = client_first.trim_start_matches("n,,").to_owned();
        let client_nonce = client_first_bare
            .split(',')
            .find_map(|e| e.strip_prefix("r="))
            .unwrap_or_default()
            .to_owned();
        let server_first = format!("r={client_nonce}mock,s={SALT},i={ITERATIONS}");
        self.message(b'R', |b| {
            b.put_u32(11);
            b.put_slice(server_first.as_bytes());
        });
        self.flush().await?;

        let (_, body) = self.read_frame().await?;
        let client_final = String::from_utf8_lossy(&body).into_owned();
        let Some((without_proof, proof)) = client_final.rsplit_once(",p=") else {
            return Ok(false);
        };
        let proof = STANDARD.decode(proof).unwrap_or_default();

        let salted = hi(PASSWORD.as_bytes(), &STANDARD.decode(SALT).unwrap(), ITERATIONS);
        let stored_key = Sha256::digest(hmac(&salted, b"Client Key"));
        let auth_message = format!("{client_first_bare},{server_first},{without_proof}");
        let signature = hmac(&stored_key, auth_message.as_bytes());
        let client_key = proof.iter().zip(signature).map(|(p, s)| p ^ s).collect::<Vec<_>>();
        if Sha256::digest(&client_key) != stored_key {
            return Ok(false);
        }

        let server_signature = hmac(&hmac(&salted, b"Server Key"), auth_message.as_bytes());
        let server_final = format!("v={}", STANDARD.encode(server_signature));
        self.message(b'R', |b| {
            b.put_u32(12);
            b.put_slice(server_final.as_bytes());
        });
        Ok(true)
    }

    // ===== Extended query =====

    fn parse(&mut self, body: &mut Bytes) {
        let name = cstr(body);
        let sql = cstr(body);
        let len = body.get_u16();
        let mut oids = (0..len).map(|_| body.get_u32()).collect::<Vec<_>>();
        // undeclared parameters resolve to text
        oids.resize(oids.len().max(placeholders(&sql)), 0);
        oids.iter_mut().filter(|oid| **oid == 0).for_each(|oid| *oid = oid::TEXT);

        if let Some(err) = syntax_error(&sql) {
            return self.fail(err);
        }
        if !name.is_empty() && self.statements.contains_key(&name) {
            return self.fail(Reply::error("42P05", &format!("prepared statement \"{name}\" already exists")));
        }
        self.statements.insert(name, Statement { oids, sql });
        self.message(b'1', |_| {});
    }

    fn bind(&mut self, body: &mut Bytes) {
        let _portal = cstr(body);
        let name = cstr(body);
        let Some(stmt) = self.statements.get(&name) else {
            let message = match name.is_empty() {
                true => "unnamed prepared statement does not exist".to_owned(),
                false => format!("prepared statement \"{name}\" does not exist"),
            };
            return self.fail(Reply::error("26000", &message));
        };

        let len = body.get_u16() as usize;
        let param_formats = (0..len).map(|_| body.get_i16()).collect::<Vec<_>>();
        let len = body.get_u16() as usize;
        let mut params = Vec::with_capacity(len);
        for i in 0..len {
            let format = match param_formats.len() {
                0 => 0,
                1 => param_formats[0],
                _ => param_formats[i],
            };
            let size = body.get_i32();
            if size < 0 {
                params.push(None);
                continue;
            }
            let raw = body.split_to(size as usize);
            let oid = stmt.oids.get(i).copied().unwrap_or(0);
            params.push(Some(param_text(oid, format, &raw)));
        }
        let len = body.get_u16() as usize;
        let formats = (0..len).map(|_| body.get_i16()).collect();

        self.portal = Some(Portal { sql: stmt.sql.clone(), params, formats, reply: None, sent: 0 });
        self.message(b'2', |_| {});
    }

    fn describe(&mut self, body: &mut Bytes) {
        let kind = body.get_u8();
        let name = cstr(body);
        if kind == b'S' {
            let Some(stmt) = self.statements.get(&name) else {
                return self.fail(Reply::error("26000", "prepared statement does not exist"));
            };
            let (oids, sql) = (stmt.oids.clone(), stmt.sql.clone());
            self.message(b't', |b| {
                b.put_u16(oids.len() as u16);
                oids.iter().for_each(|oid| b.put_u32(*oid));
            });
            let reply = match is_transaction_command(&sql) {
                true => Reply::Empty,
                false => (self.shared.responder)(&sql, &vec![None; oids.len()]),
            };
            match columns_of(&reply) {
                Some(columns) => self.row_description(columns, &[]),
                None => self.message(b'n', |_| {}),
            }
            return;
        }

        let Some(portal) = self.portal.as_mut() else {
            return self.fail(Reply::error("34000", "portal \"\" does not exist"));
        };
        let (sql, params) = (portal.sql.clone(), portal.params.clone());
        let reply = self.evaluate_sync(&sql, &params);
        let portal = self.portal.as_mut().unwrap();
        portal.reply = Some(reply.clone());
        let formats = portal.formats.clone();
        match columns_of(&reply) {
            Some(columns) => self.row_description(columns, &formats),
            None => self.message(b'n', |_| {}),
        }
    }

    async fn execute(&mut self, body: &mut Bytes) {
        let _portal = cstr(body);
        let max = body.get_u32() as usize;
        let Some(portal) = self.portal.as_mut() else {
            return self.fail(Reply::error("34000", "portal \"\" does not exist"));
        };
        let mut reply = match portal.reply.take() {
            Some(reply) => self.resolve(reply).await,
            None => {
                let (sql, params) = (portal.sql.clone(), portal.params.clone());
                self.evaluate(&sql, &params).await
            }
        };
        let reply = loop {
            reply = match reply {
                Reply::Notify(notifications, inner) => {
                    for (channel, payload) in notifications {
                        self.notification(channel, payload);
                    }
                    *inner
                }
                Reply::Notice(message, inner) => {
                    self.notice(message);
                    *inner
                }
                reply => break reply,
            };
        };

        if let Reply::Rows(columns, rows) = &reply {
            let portal = self.portal.as_mut().unwrap();
            let formats = portal.formats.clone();
            let start = portal.sent;
            let end = match max {
                0 => rows.len(),
                max => rows.len().min(start + max),
            };
            portal.sent = end;
            for row in &rows[start..end] {
                self.data_row(columns, row, &formats);
            }
            if end < rows.len() {
                self.portal.as_mut().unwrap().reply = Some(reply.clone());
                self.message(b's', |_| {});
                return;
            }
            let tag = format!("SELECT {}", rows.len());
            self.command_complete(&tag);
            return;
        }

        self.emit(reply, false).await;
    }

    fn close(&mut self, body: &mut Bytes) {
        let kind = body.get_u8();
        let name = cstr(body);
        match kind {
            b'S' => {
                self.statements.remove(&name);
            }
            _ => self.portal = None,
        }
        self.message(b'3', |_| {});
    }

    // ===== Simple query =====

    async fn query(&mut self, body: &mut Bytes) {
        let sql = cstr(body);
        let statements = sql.split(';').map(str::trim).filter(|e| !e.is_empty()).collect::<Vec<_>>();
        if statements.is_empty() {
            self.message(b'I', |_| {});
            return self.ready();
        }

        for stmt in statements {
            if let Some(err) = syntax_error(stmt) {
                self.emit(err, true).await;
                break;
            }
            let reply = self.evaluate(stmt, &[]).await;
            if let Some(columns) = columns_of(&reply) {
                self.row_description(columns, &[]);
            }
            match reply {
                Reply::Error(..) => {
                    self.emit(reply, true).await;
                    break;
                }
                Reply::CopyIn => {
                    self.emit(reply, true).await;
                    // ReadyForQuery follows the copy
                    return;
                }
                reply => self.emit(reply, true).await,
            }
        }
        self.ready();
    }

    // ===== Copy =====

    fn copy_message(&mut self, msgtype: u8, body: Bytes) {
        let Some(copy) = self.copy.as_mut() else {
            return;
        };
        let simple = copy.simple;
        match msgtype {
            b'd' => copy.data.extend_from_slice(&body),
            b'c' => {
                let rows = count_copy_rows(&copy.data);
                self.copy = None;
                self.command_complete(&format!("COPY {rows}"));
                if simple {
                    self.ready();
                }
            }
            b'f' => {
                self.copy = None;
                let reason = String::from_utf8_lossy(&body[..body.len().saturating_sub(1)]).into_owned();
                self.fail(Reply::error("57014", &format!("COPY from stdin failed: {reason}")));
                if simple {
                    self.skip = false;
                    self.ready();
                }
            }
            // ignored during copy-in
            b'S' | b'H' => {}
            _ => {
                self.copy = None;
                self.fail(Reply::error(
                    "08P01",
                    &format!("unexpected message type 0x{msgtype:02X} during COPY from stdin"),
                ));
                if simple {
                    self.skip = false;
                    self.ready();
                }
            }
        }
    }

    // ===== Statement evaluation =====

    /// Apply transaction commands, otherwise ask the responder.
    fn evaluate_sync(&mut self, sql: &str, params: &[Option<String>]) -> Reply {
        let reply = self.transaction_command(sql).unwrap_or_else(|| (self.shared.responder)(sql, params));
        if let Reply::Error(..) = reply {
            self.abort();
        }
        reply
    }

    async fn evaluate(&mut self, sql: &str, params: &[Option<String>]) -> Reply {
        let reply = self.evaluate_sync(sql, params);
        self.resolve(reply).await
    }

    /// Wait out a [`Reply::Sleep`].
    async fn resolve(&mut self, reply: Reply) -> Reply {
        match reply {
            Reply::Sleep => {
                let cancelled = tokio::time::timeout(Duration::from_secs(5), self.shared.cancel.notified()).await;
                match cancelled {
                    Ok(()) => {
                        self.abort();
                        Reply::error("57014", "canceling statement due to user request")
                    }
                    Err(_) => Reply::command("SELECT 1"),
                }
            }
            reply => reply,
        }
    }

    fn transaction_command(&mut self, sql: &str) -> Option<Reply> {
        let upper = sql.trim().to_ascii_uppercase();
        let name = sql.split_whitespace().last().unwrap_or_default().to_owned();

        if self.tx == b'E' && !(upper.starts_with("ROLLBACK") || upper.starts_with("ABORT") || upper == "COMMIT") {
            return Some(Reply::error(
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block",
            ));
        }

        let reply = if upper.starts_with("BEGIN") {
            self.tx = b'T';
            Reply::command("BEGIN")
        } else if upper == "COMMIT" {
            let tag = if self.tx == b'E' { "ROLLBACK" } else { "COMMIT" };
            self.tx = b'I';
            self.savepoints.clear();
            Reply::command(tag)
        } else if upper.starts_with("ROLLBACK TO SAVEPOINT") {
            let Some(pos) = self.savepoints.iter().position(|e| *e == name) else {
                return Some(Reply::error("3B001", &format!("savepoint \"{name}\" does not exist")));
            };
            self.savepoints.truncate(pos + 1);
            self.tx = b'T';
            Reply::command("ROLLBACK")
        } else if upper == "ROLLBACK" || upper == "ABORT" {
            self.tx = b'I';
            self.savepoints.clear();
            Reply::command("ROLLBACK")
        } else if upper.starts_with("SAVEPOINT") {
            if self.tx == b'I' {
                return Some(Reply::error("25P01", "SAVEPOINT can only be used in transaction blocks"));
            }
            self.savepoints.push(name);
            Reply::command("SAVEPOINT")
        } else if upper.starts_with("RELEASE") {
            let Some(pos) = self.savepoints.iter().position(|e| *e == name) else {
                return Some(Reply::error("3B001", &format!("savepoint \"{name}\" does not exist")));
            };
            self.savepoints.truncate(pos);
            Reply::command("RELEASE")
        } else if upper.starts_with("LISTEN") {
            Reply::command("LISTEN")
        } else if upper.starts_with("UNLISTEN") {
            Reply::command("UNLISTEN")
        } else {
            return None;
        };
        Some(reply)
    }

    fn abort(&mut self) {
        if self.tx == b'T' {
            self.tx = b'E';
        }
    }

    /// Write the messages of `reply`, description of rows excluded.
    async fn emit(&mut self, reply: Reply, simple: bool) {
        match reply {
            Reply::Rows(columns, rows) => {
                for row in &rows {
                    self.data_row(&columns, row, &[]);
                }
                self.command_complete(&format!("SELECT {}", rows.len()));
            }
            Reply::Command(tag) => self.command_complete(&tag),
            Reply::Error(code, message) => self.fail(Reply::Error(code, message)),
            Reply::Empty => self.message(b'I', |_| {}),
            Reply::CopyIn => {
                self.message(b'G', |b| {
                    b.put_u8(0);
                    b.put_u16(0);
                });
                self.copy = Some(CopyIn { data: Vec::new(), simple });
            }
            Reply::CopyOut(lines) => {
                self.message(b'H', |b| {
                    b.put_u8(0);
                    b.put_u16(0);
                });
                for line in &lines {
                    self.message(b'd', |b| b.put_slice(line.as_bytes()));
                }
                self.message(b'c', |_| {});
                self.command_complete(&format!("COPY {}", lines.len()));
            }
            Reply::Notify(notifications, inner) => {
                for (channel, payload) in notifications {
                    self.notification(channel, payload);
                }
                Box::pin(self.emit(*inner, simple)).await;
            }
            Reply::Notice(message, inner) => {
                self.notice(message);
                Box::pin(self.emit(*inner, simple)).await;
            }
            Reply::NotifyLater(delay, channel, payload) => {
                self.later = Some((delay, channel, payload));
                self.command_complete("NOTIFY");
            }
            Reply::Sleep => self.command_complete("SELECT 1"),
        }
    }

    // ===== Messages =====

    /// Report an error, skipping until `Sync` in the extended protocol.
    fn fail(&mut self, reply: Reply) {
        let Reply::Error(code, message) = reply else {
            return;
        };
        self.abort();
        self.skip = true;
        self.error(code, &message);
    }

    fn error(&mut self, code: &str, message: &str) {
        self.message(b'E', |b| {
            put_field(b, b'S', "ERROR");
            put_field(b, b'V', "ERROR");
            put_field(b, b'C', code);
            put_field(b, b'M', message);
            b.put_u8(0);
        });
    }

    fn notice(&mut self, message: &str) {
        self.message(b'N', |b| {
            put_field(b, b'S', "WARNING");
            put_field(b, b'V', "WARNING");
            put_field(b, b'C', "01000");
            put_field(b, b'M', message);
            b.put_u8(0);
        });
    }

    fn ready(&mut self) {
        self.skip = false;
        let tx = self.tx;
        self.message(b'Z', |b| b.put_u8(tx));
    }

    fn command_complete(&mut self, tag: &str) {
        self.message(b'C', |b| put_cstr(b, tag));
    }

    fn notification(&mut self, channel: &str, payload: &str) {
        self.message(b'A', |b| {
            b.put_u32(PROCESS_ID + 1);
            put_cstr(b, channel);
            put_cstr(b, payload);
        });
    }

    fn parameter_status(&mut self, name: &str, value: &str) {
        self.message(b'S', |b| {
            put_cstr(b, name);
            put_cstr(b, value);
        });
    }

    fn row_description(&mut self, columns: &[(&'static str, Oid)], formats: &[i16]) {
        self.message(b'T', |b| {
            b.put_u16(columns.len() as u16);
            for (i, (name, oid)) in columns.iter().enumerate() {
                put_cstr(b, name);
                b.put_u32(0);
                b.put_i16(0);
                b.put_u32(*oid);
                b.put_i16(-1);
                b.put_i32(-1);
                b.put_i16(format_of(formats, i));
            }
        });
    }

    fn data_row(&mut self, columns: &[(&'static str, Oid)], row: &[Option<String>], formats: &[i16]) {
        self.message(b'D', |b| {
            b.put_u16(row.len() as u16);
            for (i, value) in row.iter().enumerate() {
                let Some(value) = value else {
                    b.put_i32(-1);
                    continue;
                };
                let oid = columns.get(i).map(|e| e.1).unwrap_or(oid::TEXT);
                let raw = match format_of(formats, i) {
                    1 => binary_value(oid, value),
                    _ => value.as_bytes().to_vec(),
                };
                b.put_i32(raw.len() as i32);
                b.put_slice(&raw);
            }
        });
    }

    fn message(&mut self, msgtype: u8, body: impl FnOnce(&mut BytesMut)) {
        let mut buf = BytesMut::new();
        body(&mut buf);
        self.out.put_u8(msgtype);
        self.out.put_i32(buf.len() as i32 + 4);
        self.out.put_slice(&buf);
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        if !self.out.is_empty() {
            let out = self.out.split();
            self.stream.write_all(&out).await?;
        }
        Ok(())
    }

    async fn read_frame(&mut self) -> std::io::Result<(u8, Bytes)> {
        let msgtype = self.stream.read_u8().await?;
        let len = self.stream.read_i32().await?;
        let mut body = vec![0; len as usize - 4];
        self.stream.read_exact(&mut body).await?;
        Ok((msgtype, Bytes::from(body)))
    }
}

fn syntax_error(sql: &str) -> Option<Reply> {
    let word = sql.split_whitespace().next().unwrap_or_default().to_ascii_uppercase();
    match KEYWORDS.contains(&word.as_str()) {
        true => None,
        false => Some(Reply::error("42601", &format!("syntax error at or near \"{word}\""))),
    }
}

fn is_transaction_command(sql: &str) -> bool {
    const COMMANDS: &[&str] = &["BEGIN", "COMMIT", "ROLLBACK", "ABORT", "SAVEPOINT", "RELEASE", "LISTEN", "UNLISTEN"];
    let upper = sql.trim().to_ascii_uppercase();
    COMMANDS.iter().any(|e| upper.starts_with(e))
}

/// Highest `$n` placeholder in `sql`.
fn placeholders(sql: &str) -> usize {
    sql.split('$')
        .skip(1)
        .filter_map(|e| {
            let end = e.find(|c: char| !c.is_ascii_digit()).unwrap_or(e.len());
            e[..end].parse::<usize>().ok()
        })
        .max()
        .unwrap_or(0)
}

fn columns_of(reply: &Reply) -> Option<&[(&'static str, Oid)]> {
    match reply {
        Reply::Rows(columns, _) => Some(columns),
        Reply::Notify(_, inner) | Reply::Notice(_, inner) => columns_of(inner),
        _ => None,
    }
}

fn format_of(formats: &[i16], i: usize) -> i16 {
    match formats.len() {
        0 => 0,
        1 => formats[0],
        _ => formats.get(i).copied().unwrap_or(0),
    }
}

fn binary_value(oid: Oid, value: &str) -> Vec<u8> {
    match oid {
        oid::INT4 => value.parse::<i32>().unwrap().to_be_bytes().to_vec(),
        oid::INT8 => value.parse::<i64>().unwrap().to_be_bytes().to_vec(),
        oid::BOOL => vec![(value == "t") as u8],
        _ => value.as_bytes().to_vec(),
    }
}

fn param_text(oid: Oid, format: i16, raw: &[u8]) -> String {
    if format == 0 {
        return String::from_utf8_lossy(raw).into_owned();
    }
    match (oid, raw.len()) {
        (oid::INT4, 4) => i32::from_be_bytes(raw.try_into().unwrap()).to_string(),
        (oid::INT8, 8) => i64::from_be_bytes(raw.try_into().unwrap()).to_string(),
        (oid::BOOL, 1) => if raw[0] == 1 { "t" } else { "f" }.to_owned(),
        _ => String::from_utf8_lossy(raw).into_owned(),
    }
}

/// Rows of a copy stream, binary tuples or text lines.
fn count_copy_rows(data: &[u8]) -> usize {
    let Some(mut body) = data.strip_prefix(b"PGCOPY\n\xff\r\n\0".as_slice()) else {
        return data.iter().filter(|b| **b == b'\n').count();
    };
    body = &body[8..];
    let mut rows = 0;
    loop {
        let fields = body.get_i16();
        if fields == -1 {
            return rows;
        }
        for _ in 0..fields {
            let len = body.get_i32();
            if len > 0 {
                body.advance(len as usize);
            }
        }
        rows += 1;
    }
}

fn cstr(body: &mut Bytes) -> String {
    let end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
    let value = String::from_utf8_lossy(&body[..end]).into_owned();
    body.advance((end + 1).min(body.len()));
    value
}

fn put_cstr(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

fn put_field(buf: &mut BytesMut, field: u8, value: &str) {
    buf.put_u8(field);
    put_cstr(buf, value);
}
