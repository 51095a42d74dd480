pub mod backend;
pub mod local;
pub mod process;
pub mod session;

pub use backend::*;
pub use local::*;
pub use process::*;
pub use session::*;
