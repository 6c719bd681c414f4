pub mod blob;
pub mod digest;
pub mod tag;

pub use blob::BlobInfo;
pub use digest::{Algorithm, Digest, DigestError, DigestHasher};
pub use tag::{Resolved, Tag, TagPage};
