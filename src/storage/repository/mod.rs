pub mod checkpoint_repo;
pub mod credential_repo;
pub mod item_repo;
pub mod job_repo;

pub use checkpoint_repo::CheckpointRepository;
pub use credential_repo::CredentialRepository;
pub use item_repo::ItemRepository;
pub use job_repo::JobRepository;
