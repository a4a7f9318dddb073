//! Per session state shared by every operation.
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
};

use crate::{
    codec::Registry,
    common::ByteStr,
    hooks::Hooks,
    postgres::{PgFormat, ProtocolError, backend::BackendKeyData},
    statement::StatementCache,
};

use super::Config;

/// Transaction status reported by the last `ReadyForQuery`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TxStatus {
    /// Not in a transaction block.
    #[default]
    Idle,
    /// In a transaction block.
    InTransaction,
    /// In a failed transaction block, statements are rejected until rollback.
    Failed,
}

impl TxStatus {
    pub(crate) fn from_byte(status: u8) -> Result<Self, ProtocolError> {
        match status {
            b'I' => Ok(Self::Idle),
            b'T' => Ok(Self::InTransaction),
            b'E' => Ok(Self::Failed),
            _ => Err(ProtocolError::malformed("unknown transaction status")),
        }
    }
}

/// Asynchronous notification from `LISTEN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    process_id: u32,
    channel: ByteStr,
    payload: ByteStr,
}

impl Notification {
    pub(crate) fn new(process_id: u32, channel: ByteStr, payload: ByteStr) -> Self {
        Self { process_id, channel, payload }
    }

    /// Process id of the notifying backend.
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }
}

/// Operation currently owning the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Activity {
    Query,
    CopyIn,
    CopyOut,
}

impl Activity {
    pub(crate) fn busy_reason(self) -> &'static str {
        match self {
            Activity::Query => "query in progress",
            Activity::CopyIn => "copy in progress",
            Activity::CopyOut => "copy out in progress",
        }
    }
}

/// State every [`PgTransport`][crate::transport::PgTransport] exposes to operations.
pub struct SessionState {
    pub(crate) tx_status: TxStatus,
    pub(crate) registry: Arc<Registry>,
    pub(crate) statements: StatementCache,
    pub(crate) result_format: PgFormat,
    pub(crate) hooks: Option<Arc<dyn Hooks>>,
    pub(crate) notifications: VecDeque<Notification>,
    pub(crate) parameters: HashMap<String, String>,
    pub(crate) key: Option<BackendKeyData>,
    pub(crate) activity: Option<Activity>,
    /// `ReadyForQuery` still owed for messages already sent.
    pub(crate) pending_ready: usize,
    /// Open transaction frames, `0` outside transaction.
    pub(crate) depth: usize,
    pub(crate) broken: bool,
}

impl SessionState {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            tx_status: TxStatus::Idle,
            registry: config.registry.clone(),
            statements: StatementCache::new(config.statement_cache),
            result_format: config.result_format,
            hooks: config.hooks.clone(),
            notifications: VecDeque::new(),
            parameters: HashMap::new(),
            key: None,
            activity: None,
            pending_ready: 0,
            depth: 0,
            broken: false,
        }
    }

    pub fn tx_status(&self) -> TxStatus {
        self.tx_status
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn statements(&self) -> &StatementCache {
        &self.statements
    }

    /// Server reported run-time parameter.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Number of open transaction frames.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub(crate) fn hooks(&self) -> Option<Arc<dyn Hooks>> {
        self.hooks.clone()
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("tx_status", &self.tx_status)
            .field("statements", &self.statements.len())
            .field("notifications", &self.notifications.len())
            .field("activity", &self.activity)
            .field("pending_ready", &self.pending_ready)
            .field("depth", &self.depth)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}
