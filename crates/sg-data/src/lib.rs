pub mod catalog;
pub mod loaders;
pub mod store;

pub use catalog::*;
pub use loaders::*;
pub use store::*;
