//! Async request execution engine for databases speaking the CQL native
//! protocol (v4), such as Apache Cassandra®.
//!
//! # Driver overview
//! ### Connecting
//! All driver activity revolves around the [Session]\
//! `Session` is created by specifying a few known nodes and connecting to them:
//!
//! ```rust,no_run
//! use corvid::{Session, SessionBuilder};
//! use std::error::Error;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!    let session: Session = SessionBuilder::new()
//!         .known_node("127.0.0.1:9042")
//!         .known_node("1.2.3.4:9876")
//!         .build()
//!         .await?;
//!
//!    Ok(())
//! }
//! ```
//! From the known nodes the driver discovers the rest of the cluster,
//! opens a pool of connections to every node, and keeps the view current
//! by listening to server events over a dedicated control connection.
//!
//! ### Making queries
//! After successfully connecting to the cluster we can make queries.\
//! Every request is sent along a plan computed by the
//! [load balancing policy](policies::load_balancing). Failed attempts fail
//! over to the next node of the plan, or are retried as the
//! [retry policy](policies::retry) decides.
//!
//! ```rust,no_run
//! # use corvid::{Session, SerializedValues};
//! # use std::error::Error;
//! # async fn check_only_compiles(session: &Session) -> Result<(), Box<dyn Error>> {
//! let mut values = SerializedValues::new();
//! values.add_value(&2_i32)?;
//! values.add_value(&"some text")?;
//!
//! session
//!     .query("INSERT INTO ks.tab (a, b) VALUES(?, ?)", &values)
//!     .await?;
//!
//! let prepared = session.prepare("SELECT a, b FROM ks.tab").await?;
//! let result = session.execute(&prepared, &SerializedValues::new()).await?;
//! for row in result.rows().unwrap_or_default() {
//!     println!("{:?}", row.columns);
//! }
//! # Ok(())
//! # }
//! ```

pub mod authentication;
pub mod client;
pub mod cluster;
pub mod errors;
pub(crate) mod network;
pub mod policies;
pub mod response;
pub mod routing;
pub mod statement;

#[cfg(test)]
pub(crate) mod test_utils;

pub use corvid_cql::frame::response::result::{ColumnSpec, ColumnType, CqlValue, Row};
pub use corvid_cql::{Consistency, SerialConsistency, SerializedValues};

pub use client::session::{Session, SessionConfig};
pub use client::session_builder::SessionBuilder;
pub use response::QueryResult;
pub use statement::{Batch, BatchStatement, BatchType, PreparedStatement, Statement};
