pub mod config;
pub mod interval;
pub mod models;
pub mod months;

pub use config::*;
pub use interval::*;
pub use models::*;
pub use months::*;
