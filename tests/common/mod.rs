#![allow(dead_code)]

pub mod adapters;
pub mod builders;

pub use adapters::*;
pub use builders::*;
