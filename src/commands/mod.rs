pub mod log;
pub mod settings;
pub mod sync;
