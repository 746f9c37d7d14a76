//! Database access layer

pub mod init;
pub mod retry;

pub use init::init_database;
pub use retry::retry_on_lock;
