use std::time::Duration;
use pgsession::{Connection, Result, execute, notify::{listen, unlisten}};

pub async fn main() -> Result<()> {
    let mut listener = Connection::connect_env().await?;
    let mut sender = Connection::connect_env().await?;

    listen("jobs", &mut listener).await?;
    execute("SELECT pg_notify('jobs', 'first')", &mut sender).await?;

    let n = listener.wait_for_notification(Some(Duration::from_secs(5))).await?;
    assert_eq!((n.channel(), n.payload()), ("jobs", "first"));

    let err = listener
        .wait_for_notification(Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    let err = listener
        .wait_for_notification_or(tokio::time::sleep(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(err.is_cancelled());

    unlisten("jobs", &mut listener).await?;

    Ok(())
}
