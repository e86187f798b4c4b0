pub mod cache;
pub mod mover;
pub mod store;

pub use cache::Cache;
pub use mover::DataMover;
pub use store::{HttpObjectStore, NodeInfo, ObjectStore, PutFileRequest};
