//! 实体存储：工作池、部署、流运行

pub mod entity_store;
pub mod records;

pub use entity_store::{EntityStore, RunHandle};
pub use records::*;
