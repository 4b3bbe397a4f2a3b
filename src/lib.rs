pub mod config;
pub mod gateway;
pub mod limits;
pub mod mail;
pub mod model;
pub mod notify;
pub mod observability;
pub mod policy;
pub mod reconcile;
pub mod room_sync;
pub mod scheduler;
pub mod store;
pub mod tenant;
pub mod wal;
