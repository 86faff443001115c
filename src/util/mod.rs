pub mod expiring_map;
pub mod keyed_timer;
pub mod random;
