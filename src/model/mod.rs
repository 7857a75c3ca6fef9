// model/mod.rs - entity definitions the reconciler and resolver operate on

pub mod task;

pub use task::{MetadataValue, Priority, Status, Task, TaskId};
