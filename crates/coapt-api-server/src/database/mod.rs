pub mod models;
pub mod pool;
pub mod repository;
pub mod thread_repository;

pub use models::*;
pub use pool::DbPool;
pub use repository::ListingRepository;
pub use thread_repository::PgThreadStore;
