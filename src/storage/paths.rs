// PathManager maps content addresses and upload sessions to files under the
// storage root. Tags and blob metadata live in the database; only bytes are
// kept on disk.
//
// The path layout in the storage backend is roughly as follows:
//
//	<root>/v2
//	├── blobs
//	│   └── <algorithm>
//	│       └── <first two hex chars>
//	│           └── <hex>
//	│               └── data
//	└── uploads
//	    ├── <session id>
//	    │   └── data
//	    └── _staging
//	        └── <uuid>
//
// Files only ever reach `blobs/` through a rename from `uploads/`, so a blob
// path never holds a partially written file.

use crate::domain::Digest;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct PathManager {
    root_path: PathBuf,
}

impl PathManager {
    pub fn new(root: impl AsRef<Path>) -> Self {
        PathManager {
            root_path: root.as_ref().to_path_buf(),
        }
    }

    /// Returns the path to the root of the blob binaries,
    /// (e.g. `<root>/v2/blobs/`).
    pub fn blobs_path(&self) -> PathBuf {
        self.root_path.join("v2").join("blobs")
    }

    /// Returns the path to a single blob directory,
    /// (e.g. `<root>/v2/blobs/<algorithm>/<first two hex chars>/<hex>`).
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.hex();
        self.blobs_path()
            .join(digest.algorithm().as_str())
            .join(&hex[..2])
            .join(hex)
    }

    /// Returns the path to the data of a single blob binary
    /// (e.g. `<root>/v2/blobs/<algorithm>/<first two hex chars>/<hex>/data`).
    pub fn blob_data_path(&self, digest: &Digest) -> PathBuf {
        self.blob_path(digest).join("data")
    }

    /// Returns the path to the root of uploads,
    /// (e.g. `<root>/v2/uploads`).
    pub fn uploads_path(&self) -> PathBuf {
        self.root_path.join("v2").join("uploads")
    }

    /// Returns the path to a single upload session,
    /// (e.g. `<root>/v2/uploads/<id>`).
    pub fn upload_path(&self, id: &str) -> PathBuf {
        self.uploads_path().join(id)
    }

    /// Returns the path to the data of a single upload session,
    /// (e.g. `<root>/v2/uploads/<id>/data`).
    pub fn upload_data_path(&self, id: &str) -> PathBuf {
        self.upload_path(id).join("data")
    }

    /// Returns a fresh scratch file for single-shot writes,
    /// (e.g. `<root>/v2/uploads/_staging/<uuid>`).
    pub fn staging_path(&self) -> PathBuf {
        self.uploads_path()
            .join("_staging")
            .join(uuid::Uuid::new_v4().to_string())
    }
}
