pub mod error;
pub mod stomp;
pub mod websocket;
pub use error::{Result, StreamError};
