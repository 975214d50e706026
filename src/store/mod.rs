pub mod in_memory;
pub mod sqlite;

pub use in_memory::InMemoryTransactionStore;
pub use sqlite::SqliteTransactionStore;
