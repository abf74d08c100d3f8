pub mod address;
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod services;
pub mod stage;
pub mod utils;

pub use address::RemoteAddress;
pub use error::{FloodError, TransportError};
pub use stage::{Stage, StageTree};
