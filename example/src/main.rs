use tracing::{Instrument, trace_span};
use tracing_subscriber::{
    EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use pgsession::Result;

mod connection;
mod query;
mod copy;
mod notify;
mod decode;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::Registry::default()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    connection::main().instrument(trace_span!("connection")).await?;
    query::main().instrument(trace_span!("query")).await?;
    copy::main().instrument(trace_span!("copy")).await?;
    notify::main().instrument(trace_span!("notify")).await?;
    decode::main().instrument(trace_span!("decode")).await?;

    Ok(())
}
