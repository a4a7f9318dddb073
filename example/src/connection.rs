use std::time::Duration;
use pgsession::{CacheMode, Config, Connection, Result, execute, query};

pub async fn main() -> Result<()> {
    // PGUSER, PGPASSWORD, PGHOST, PGPORT, PGDATABASE, PGSSLMODE
    let mut conn = Connection::connect_env().await?;
    tracing::info!(
        server_version = conn.parameter("server_version"),
        pid = conn.process_id(),
        tls = conn.is_tls(),
        "connected"
    );
    query::<_, _, ()>("SELECT 1", &mut conn).fetch_all().await?;
    conn.close().await?;

    // no prepared statement at all, parameterless text queries use the simple protocol
    let config = Config::from_env()
        .statement_cache(CacheMode::Disabled)
        .connect_timeout(Duration::from_secs(5));
    let mut conn = Connection::connect(&config).await?;
    query::<_, _, (i32,)>("SELECT 1", &mut conn).fetch_one().await?;

    // cancel a statement from another task
    let token = conn.cancel_token().expect("server sent its cancellation key");
    let cancel = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel().await
    });
    let err = execute("SELECT pg_sleep(10)", &mut conn).await.unwrap_err();
    assert_eq!(err.code(), Some("57014"));
    cancel.await.unwrap()?;

    assert!(conn.is_healthy());
    conn.close().await?;

    Ok(())
}
