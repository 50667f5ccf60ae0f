//! Built-in fetchers.

mod command;
mod http;

pub use command::{parse_percent, CommandFetcher};
pub use http::HttpFetcher;
