pub mod error;
pub mod store;
pub mod token_file;

pub use error::SecretError;
pub use store::{ChainedSecretStore, EnvSecretStore, MemorySecretStore, SecretStore, SecretValue};
pub use token_file::{FileTokenStore, TokenStatus};
