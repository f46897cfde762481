/// Sort-key and name normalization rules.
pub mod naming;
/// On-disk layout of stored books.
pub mod storage;

pub use storage::StorageLayout;
