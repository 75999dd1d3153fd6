//! Resume state for archives
//!
//! Enumeration and download ask a [`ResumeMarker`] whether an archive is
//! already in place. The default marker treats the local mirror itself as the
//! resume state.

use std::fs;
use std::path::{Path, PathBuf};

use crate::market::CandidateResource;

pub trait ResumeMarker: Send + Sync {
    /// Where the archive for `resource` lives locally
    fn local_path(&self, resource: &CandidateResource) -> PathBuf;

    /// Something is recorded for this resource, whatever its size
    fn is_present(&self, resource: &CandidateResource) -> bool;

    /// Present and matching the expected size (any size when the hint is 0)
    fn is_complete(&self, resource: &CandidateResource) -> bool;
}

/// File presence and length in the local mirror
#[derive(Debug, Clone)]
pub struct LocalFileMarker {
    root: PathBuf,
}

impl LocalFileMarker {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl ResumeMarker for LocalFileMarker {
    fn local_path(&self, resource: &CandidateResource) -> PathBuf {
        resource.local_path(&self.root)
    }

    fn is_present(&self, resource: &CandidateResource) -> bool {
        self.local_path(resource).is_file()
    }

    fn is_complete(&self, resource: &CandidateResource) -> bool {
        match fs::metadata(self.local_path(resource)) {
            Ok(meta) if meta.is_file() => {
                resource.size_hint == 0 || meta.len() == resource.size_hint
            }
            _ => false,
        }
    }
}
