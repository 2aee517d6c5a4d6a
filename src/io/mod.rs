//! Storage URIs and content hashing

pub mod hash;
pub mod uri;

pub use hash::{md5_bytes, md5_file, md5_string};
pub use uri::{Scheme, StorageUri, key_of, local_path_for, relative_key};
