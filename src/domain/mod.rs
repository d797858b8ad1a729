pub mod market;
pub mod order;
pub mod strategy;

pub use market::*;
pub use order::*;
pub use strategy::*;
