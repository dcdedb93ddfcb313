pub mod data;
pub mod study;
pub mod sync;
