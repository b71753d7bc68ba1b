pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod types;

pub use error::TaskdError;
