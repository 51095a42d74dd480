pub mod errors;
pub mod config;
pub mod macros;
pub mod table;

pub use errors::*;
pub use config::*;
pub use macros::*;
pub use table::*;
