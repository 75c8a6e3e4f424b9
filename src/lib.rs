pub mod allocator;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod output;
pub mod remote;
pub mod resolver;
pub mod spatial;
