pub mod download;
pub mod pipeline;
pub mod report;
pub mod source;
pub mod store;
pub mod validate;
