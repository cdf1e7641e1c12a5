//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod safetcp;

pub use config::config_section;
pub use error::{ErrorKind, StrataError};
pub use print::{logger_init, set_me, ME};

pub(crate) use safetcp::{tcp_bind_in_range, tcp_connect_with_retry};
