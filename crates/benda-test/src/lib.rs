pub mod programs;
pub mod strategies;

pub use programs::{leaf, list, node, pair, tree_engine};
