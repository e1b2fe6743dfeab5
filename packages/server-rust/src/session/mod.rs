//! Session plumbing shared by the admission pipeline.

pub mod cookie;

pub use cookie::CookieCodec;
