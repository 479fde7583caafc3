pub mod nad;
pub mod namespaces;
pub mod stream_parser;
pub mod stream_writer;

pub use nad::Nad;
