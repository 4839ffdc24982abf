//! Teapotnet resource layer
//!
//! A resource is an immutable tree of content blocks referenced by an
//! index block; the digest of the index block is the resource handle.
//! Directories are resources whose body is a sequence of directory
//! records, each pointing at another resource. Readers map positions
//! to blocks and fetch them lazily through the caller plane.

pub mod builder;
pub mod error;
pub mod fetcher;
pub mod reader;
pub mod records;
pub mod resource;

pub use builder::{build_directory, process_bytes, process_file, ProcessOptions};
pub use error::ResourceError;
pub use fetcher::BlockFetcher;
pub use reader::Reader;
pub use records::{DirectoryRecord, IndexRecord};
pub use resource::Resource;

/// Resource kind tag for directories
pub const KIND_DIRECTORY: &str = "directory";

/// Resource kind tag for plain files
pub const KIND_FILE: &str = "file";
