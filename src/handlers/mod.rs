pub mod proxy;
pub mod static_files;

pub use proxy::*;
pub use static_files::*;
