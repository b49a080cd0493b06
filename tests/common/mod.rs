#![allow(dead_code)] // Each test binary uses a different subset of the fixtures

pub mod plant;
pub mod scripted_executor;
pub mod strategies;

pub use plant::*;
pub use scripted_executor::*;
