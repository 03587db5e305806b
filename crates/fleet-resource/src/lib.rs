//! Fleet resource manager (C7): the room-stats-augmented watcher, the pick
//! operation, and the housekeeping loop, composed on top of two
//! [`kv_watch::HealthyModuleWatcher`]s (media nodes, mixers).

pub mod housekeeping;
pub mod module_usage;
pub mod pick;
pub mod room_stats;

pub use housekeeping::Housekeeping;
pub use module_usage::ModuleUsage;
pub use pick::pick;
pub use room_stats::RoomStatsWatcher;
