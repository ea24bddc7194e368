pub use codec::*;
pub use frame::*;
pub use raw::*;

mod codec;
mod frame;
mod raw;
