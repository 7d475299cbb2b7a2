//! Store client instrumentation: cache commands and database
//! connectivity checks.

pub mod redis;
pub mod sql;

pub(crate) const DB_TYPE_TAG: &str = "db.type";
pub(crate) const DB_STATEMENT_TAG: &str = "db.statement";
pub(crate) const ERROR_TAG: &str = "error";
pub(crate) const ERROR_EVENT: &str = "error";
pub(crate) const MESSAGE_KEY: &str = "message";
