pub mod backends;
pub mod core;
pub mod handles;

// Re-export commonly used items
pub use self::backends::accounts::{get_backend, AccountStore, MockBackend, SystemBackend};
pub use self::core::{Handle, Registry, Status};
pub use self::handles::accounts::{AccountsHandle, AccountsOptions, RunReport};
