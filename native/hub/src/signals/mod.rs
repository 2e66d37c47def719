pub mod engine;
pub mod system;
pub mod updater;
