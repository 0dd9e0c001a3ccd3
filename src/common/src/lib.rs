pub mod catalog;
pub mod config;
pub mod model;

pub use catalog::Catalog;
pub use config::Configuration;
pub use model::EntryKey;
