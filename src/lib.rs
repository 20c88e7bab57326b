pub mod comm;
pub mod direct;
pub mod error;
pub mod gravity;
pub mod kernel;
pub mod settings;
pub mod shared;
pub mod softening;
pub mod tree;
pub mod treewalk;
pub mod units;
