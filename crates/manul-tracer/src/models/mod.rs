//! Data models for Manul Tracer

mod image;
mod message;
mod query;
mod session;
mod trace;

pub use image::*;
pub use message::*;
pub use query::*;
pub use session::*;
pub use trace::*;
