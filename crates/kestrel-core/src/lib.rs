pub mod config;
pub mod paths;
pub mod proto;

pub use config::ClientConfig;
pub use proto::{flag, ErrCode, Request, Response, Verb};
