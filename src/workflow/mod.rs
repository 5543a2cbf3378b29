pub mod builder;
pub mod graph;
pub mod types;

pub use builder::FlowBuilder;
pub use graph::DependencyGraph;
pub use types::*;
