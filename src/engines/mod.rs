pub mod sqlite;
pub use sqlite::{SqliteMetadataStore, StoreStats};
