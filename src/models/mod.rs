pub mod candidate;
pub mod engineer;
pub mod order;
