//! Common utilities and types

pub mod context;
pub mod error;
pub mod net;
pub mod socks;

pub use context::DialContext;
pub use error::{Error, Result};
pub use net::{Address, Network};
