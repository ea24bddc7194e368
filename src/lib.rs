pub mod bridge;
pub mod bus;
pub mod channel;
pub mod error;
pub mod model;
pub mod monitor;
pub mod prelude;
pub mod stomp;
pub mod utils;
