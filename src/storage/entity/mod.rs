pub mod checkpoint;
pub mod credential_usage;
pub mod item;
pub mod job;

pub use checkpoint::Entity as Checkpoint;
pub use credential_usage::Entity as CredentialUsage;
pub use item::Entity as Item;
pub use job::Entity as Job;
