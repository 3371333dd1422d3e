//! Client-facing HTTP listener.

mod listener;

pub use listener::{error_response, FrontendListener};
