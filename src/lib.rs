pub mod config;
pub mod control;
pub mod http;
pub mod raft;
pub mod routing;
pub mod status;
pub mod version;
