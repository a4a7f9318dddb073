//! Postgres wire protocol session engine
//!
//! One [`Connection`] is one server session. Every operation takes the session by value or by
//! mutable reference through [`PgTransport`][transport::PgTransport], so a [`Transaction`] frame
//! can be passed anywhere a connection is expected.
//!
//! # Examples
//!
//! ```no_run
//! use pgsession::{Config, Connection};
//!
//! # async fn app() -> pgsession::Result<()> {
//! let config = Config::new().host("localhost").user("postgres").password("postgres");
//! let mut conn = Connection::connect(&config).await?;
//!
//! let res = pgsession::query::<_, _, (i32, String)>("SELECT 420, $1", &mut conn)
//!     .bind("Foo")
//!     .fetch_one()
//!     .await?;
//!
//! assert_eq!(res.0, 420);
//! assert_eq!(res.1.as_str(), "Foo");
//! # Ok(())
//! # }
//! ```
//!
//! Transactions:
//!
//! ```no_run
//! # async fn app(conn: &mut pgsession::Connection) -> pgsession::Result<()> {
//! let mut tx = pgsession::begin(conn).await?;
//!
//! let affected = pgsession::execute("DELETE FROM post WHERE id = $1", &mut tx)
//!     .bind(1)
//!     .await?;
//!
//! if affected == 1 {
//!     tx.commit().await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Pipelining, every job is written before any reply is read:
//!
//! ```no_run
//! use pgsession::query::Pipeline;
//!
//! # async fn app(conn: &mut pgsession::Connection) -> pgsession::Result<()> {
//! let mut pipeline = Pipeline::new();
//! pipeline
//!     .add("INSERT INTO post(name) VALUES ('foo')", vec![])
//!     .add("SELECT count(*) FROM post", vec![]);
//!
//! for result in pipeline.send(conn).collect().await {
//!     match result {
//!         Ok(job) => println!("{} ({} rows)", job.tag.as_str(), job.rows.len()),
//!         Err(err) => println!("{err}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod common;
mod io;
mod net;
mod ext;
mod stream;

// Protocol
pub mod postgres;

// Encoding
pub mod codec;
mod types;

// Component
mod statement;
pub mod sql;
pub mod row;
pub mod hooks;

// Operation
pub mod transport;
pub mod query;
pub mod transaction;
pub mod copy;
pub mod notify;

// Connection
pub mod connection;

pub mod error;

#[cfg(test)]
mod testing;

pub use row::{Row, FromRow, Decode, DecodeError};
pub use sql::SqlExt;
pub use statement::{CacheMode, PreparedStatement, StatementName};

pub use connection::{Connection, Config, CancelToken};
#[doc(inline)]
pub use query::{query, query_row, execute, prepare};
pub use transaction::{Transaction, TxOptions, IsolationLevel, begin, begin_with};
pub use error::{Error, ErrorKind, Result};
