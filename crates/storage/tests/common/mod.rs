pub mod fixtures;

#[allow(unused_imports)]
pub use fixtures::{blob_files, chunked, seeded_bytes, started_store};
