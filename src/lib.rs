pub mod compactor;
pub mod config;
pub mod engine;
pub mod evaluator;
pub mod limits;
pub mod model;
pub mod observability;
pub mod sql;
pub mod tenant;
pub mod wal;
pub mod wire;
