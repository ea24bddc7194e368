pub use logger::*;
pub use wait_group::*;

mod logger;
mod wait_group;
