//! Explicit statement preparation.
use super::Running;
use crate::{
    Result,
    statement::{PreparedStatement, cache_key},
    transport::PgTransport,
};

/// Parse and describe `sql` without executing it.
///
/// The statement goes through the session statement cache, preparing an already described
/// statement again costs no round trip. With the cache disabled the statement is parsed
/// unnamed and only lives until the next query.
///
/// ```no_run
/// # async fn app(conn: &mut pgsession::Connection) -> pgsession::Result<()> {
/// let stmt = pgsession::query::prepare("SELECT name FROM post WHERE id = $1", conn).await?;
/// assert_eq!(stmt.params().len(), 1);
/// assert_eq!(stmt.columns().map(|e| e.len()), Some(1));
/// # Ok(())
/// # }
/// ```
pub async fn prepare<IO: PgTransport>(sql: &str, mut io: IO) -> Result<PreparedStatement> {
    let key = cache_key(sql, &[]);
    if let Some(stmt) = io.session().statements.get(key, sql, &[]) {
        if stmt.is_described() {
            return Ok(stmt.clone());
        }
    }

    let mut running = Running::prepare(io, sql);
    running.finish().await?;
    running
        .prepared()
        .ok_or_else(|| crate::postgres::ProtocolError::malformed("statement was never described").into())
}
