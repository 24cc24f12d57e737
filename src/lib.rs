#![forbid(unsafe_code)]

pub mod config;
pub mod embed;
pub mod error;
pub mod feed;
pub mod media;
pub mod normalize;
pub mod reactions;
pub mod resolver;
pub mod sources;
pub mod store;
