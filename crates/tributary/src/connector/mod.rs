//! Bundled [`Connector`](crate::connection::Connector) implementations

pub mod clickhouse;
