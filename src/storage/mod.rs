//! Durable storage: SQLite pool + schema, the content-addressed page store,
//! and embedding persistence/search.

pub mod content;
pub mod db;
pub mod vector;

pub use content::ContentStore;
pub use db::{open_memory_pool, open_pool};
pub use vector::{
    cosine_similarity, deserialize_embedding, persist_embedding, serialize_embedding,
    vector_search,
};
