pub mod json_repository;
pub mod memory_repository;
pub mod models;
pub mod repository;

pub use json_repository::*;
pub use memory_repository::*;
pub use models::*;
pub use repository::*;
