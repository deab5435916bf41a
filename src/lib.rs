#![doc = include_str!("../README.md")]

pub mod batch;
pub mod chunk;
pub mod hash;
pub mod prelude;
pub mod server;
pub mod store;
pub mod wire;
