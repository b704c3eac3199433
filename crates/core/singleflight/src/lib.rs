#[macro_use]
extern crate log;

#[cfg(feature = "serde")]
#[macro_use]
extern crate serde;

mod caller;
mod config;
mod context;
mod error;


pub use caller::Caller;
pub use config::CallerConfig;
pub use context::{Context, ContextError};
pub use error::Error;
