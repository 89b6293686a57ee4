pub mod dispatch;
pub mod matcher;
pub mod reaper;
pub mod registry;
