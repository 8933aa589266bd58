pub mod apps;
pub mod markers;
pub mod runs;
