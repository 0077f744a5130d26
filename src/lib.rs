pub mod archive;
pub mod assembler;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetcher;
pub mod frame;
pub mod pipeline;
pub mod store;
