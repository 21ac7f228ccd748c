pub mod config;
pub mod error;
pub mod flow;
pub mod inbound;
pub mod outbound;
pub mod tunnel;
pub mod utils;

pub use error::{Error, Result};
