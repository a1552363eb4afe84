pub mod extract;
pub mod prompt;
pub mod provider;
pub mod providers;
pub mod sse_parser;
pub mod types;
