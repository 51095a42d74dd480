pub mod executor;
pub mod generator;
pub mod graph;
pub mod notify;
pub mod progress;

pub use executor::*;
pub use generator::*;
pub use graph::*;
pub use notify::*;
pub use progress::*;
