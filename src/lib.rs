pub mod bill;
pub mod capability;
pub mod error;
pub mod feed;
pub mod ledger;
pub mod logging;
pub mod merge;
pub mod policy;
pub mod roles;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod storage;
pub mod tick;
