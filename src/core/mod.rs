pub mod clock;
pub mod mirror;
pub mod reorder;
pub mod task;
pub mod tracking;
