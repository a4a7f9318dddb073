//! Out of band query cancellation.
use bytes::BytesMut;
use tokio::io::AsyncWriteExt;

use crate::{
    Result,
    common::verbose,
    net::{Socket, Target},
    postgres::{backend::BackendKeyData, frontend::CancelRequest},
};

use super::TlsOptions;

/// Handle to request cancellation of whatever the session is running.
///
/// Cancellation is best effort: the server gives no reply, and the running statement may
/// already be finished when the request arrives. An interrupted statement fails on its own
/// session with SQLSTATE `57014`.
///
/// ```no_run
/// # async fn app(conn: &mut pgsession::Connection) -> pgsession::Result<()> {
/// let token = conn.cancel_token().expect("server sent cancellation key");
/// tokio::spawn(async move {
///     tokio::time::sleep(std::time::Duration::from_secs(1)).await;
///     let _ = token.cancel().await;
/// });
/// let result = pgsession::execute("SELECT pg_sleep(10)", conn).await;
/// assert!(result.is_err());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CancelToken {
    target: Target,
    host: String,
    tls: TlsOptions,
    key: BackendKeyData,
}

impl CancelToken {
    pub(crate) fn new(target: Target, host: String, tls: TlsOptions, key: BackendKeyData) -> Self {
        Self { target, host, tls, key }
    }

    /// Backend process id this token cancels.
    pub fn process_id(&self) -> u32 {
        self.key.process_id
    }

    /// Open a side connection, send `CancelRequest`, and close it.
    pub async fn cancel(&self) -> Result<()> {
        let socket = Socket::connect(&self.target).await?;
        let mut socket = socket.negotiate_tls(&self.tls, &self.host).await?;

        let mut buf = BytesMut::with_capacity(16);
        CancelRequest {
            process_id: self.key.process_id,
            secret_key: self.key.secret_key,
        }
        .write(&mut buf);

        socket.write_all(&buf).await?;
        socket.flush().await?;
        verbose!(process_id = self.key.process_id, "cancel request sent");

        // the server closes the connection after reading the request
        socket.shutdown().await?;
        Ok(())
    }
}
