//! Database connectivity, instance resolution and query execution.

pub mod auth;
pub mod connector;
pub mod query;
pub mod schema;
pub mod types;

pub use auth::{create_connection, RawConnection};
pub use connector::{CloudSqlConnector, ConnectInfo, InstanceConnector};
pub use query::{QueryResult, ResultRow};
pub use schema::ColumnDef;
pub use types::{SqlValue, TypeMapper};
