pub mod args;
mod backup;
mod bootstrap;
mod cloud;
pub mod commands;
mod config;
mod coordinator;
mod db;
mod engine;
mod error;
pub mod model;
mod remote;
mod status;
mod utils;


pub use backup::Backup;
pub use bootstrap::InitialState;
pub use config::{Config, SyncSettings};
pub use coordinator::{op, Coordinator, CoordinatorSettings, EnqueueOutcome, Phase, SyncLock};
pub use db::{Db, SqlParam};
pub use engine::{BudgetEngine, LoadResult};
pub use error::{Error, ErrorType, Result};
pub use remote::{Collection, Filter, Mode, Remote, RemoteCall, RemoteOp, TestRemote};
pub use status::{SyncState, SyncStatus};
