//! lookout-services: address repository and content tracking.

pub mod dedup;
pub mod repository;
pub mod tracker;

pub use dedup::DedupMap;
pub use repository::{
    DnsResolver, JsonFileStore, MemoryStore, Node, NodeStore, Repository, RepositoryConfig,
    RepositoryStats, RetrievalPolicy, SeedResolver, StaticResolver,
};
pub use tracker::Tracker;
