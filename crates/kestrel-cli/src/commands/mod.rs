pub mod kv;
pub mod stream;
