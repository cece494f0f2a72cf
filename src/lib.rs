pub mod config;
pub mod gitlab;
pub mod mapper;
pub mod notion;
pub mod retry;
pub mod sync;
