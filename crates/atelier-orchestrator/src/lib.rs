pub mod admin;
pub mod collaborators;
pub mod config;
pub mod dispatch;

pub use collaborators::*;
pub use config::*;
pub use dispatch::*;
