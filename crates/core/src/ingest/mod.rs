pub mod error;
pub mod quotes;
pub mod source;
