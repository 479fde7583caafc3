pub mod store;

pub use store::{AuthBackend, StoreHandle};
pub use store::memory::MemoryAuthBackend;
pub use store::sqlite::SqliteAuthBackend;
