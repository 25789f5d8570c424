//! Built-in storage backends.

mod http;
mod local;
mod scp;

pub use http::HttpProvider;
pub use local::LocalProvider;
pub use scp::ScpProvider;
