pub mod client;
pub mod extractor;
