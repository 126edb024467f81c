#![doc = include_str!("../README.md")]

pub mod asset;
pub mod auth;
pub mod coordinator;
pub mod market;
pub mod protocol;
pub mod storage;
mod utill;

pub use utill::{now_ms, setup_logger};
