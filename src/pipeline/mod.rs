pub mod cache;
pub mod jobs;
pub mod lifecycle;
pub mod safety;
pub mod schema;
pub mod semaphore;
pub mod structuring;
