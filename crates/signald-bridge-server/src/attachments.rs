//! Caller-supplied base64 attachments written out as files the daemon can
//! read.
//!
//! The daemon only accepts attachments by path, so each blob is decoded,
//! sniffed for its type and written to a fresh file in the attachment
//! directory. An [`AttachmentFile`] owns that file and removes it when
//! dropped, on success and failure alike.

use std::io::Write;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tempfile::TempPath;
use tracing::{debug, warn};

use signald_bridge_shared::constants::ATTACHMENT_FILE_PREFIX;
use signald_bridge_shared::RequestAttachment;

use crate::error::ServerError;

/// A decoded attachment on disk, deleted on drop.
#[derive(Debug)]
pub struct AttachmentFile {
    path: Option<TempPath>,
    size: usize,
}

impl AttachmentFile {
    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or(Path::new(""))
    }

    /// Decoded size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The daemon-facing reference to this file.
    pub fn as_request(&self) -> RequestAttachment {
        RequestAttachment {
            filename: self.path().to_string_lossy().into_owned(),
        }
    }
}

impl Drop for AttachmentFile {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        let shown = path.to_path_buf();
        match path.close() {
            Ok(()) => debug!(path = %shown.display(), "Removed attachment file"),
            Err(e) => warn!(
                path = %shown.display(),
                error = %e,
                "Failed to remove attachment file"
            ),
        }
    }
}

/// Decode and write every blob, in order.
///
/// Stops at the first blob that fails; files already written are removed
/// as the partial result is dropped.
pub fn materialize(dir: &Path, blobs: &[String]) -> Result<Vec<AttachmentFile>, ServerError> {
    let mut files = Vec::with_capacity(blobs.len());
    for blob in blobs {
        files.push(materialize_one(dir, blob)?);
    }
    Ok(files)
}

fn materialize_one(dir: &Path, blob: &str) -> Result<AttachmentFile, ServerError> {
    let bytes = STANDARD
        .decode(blob)
        .map_err(|e| ServerError::InvalidAttachment(e.to_string()))?;

    let kind = infer::get(&bytes).ok_or_else(|| {
        ServerError::InvalidAttachment("Unknown attachment file type".to_string())
    })?;

    let mut file = tempfile::Builder::new()
        .prefix(ATTACHMENT_FILE_PREFIX)
        .suffix(&format!(".{}", kind.extension()))
        .tempfile_in(dir)
        .map_err(|e| io_error(dir, e))?;

    // From here on the file is removed if anything fails
    file.write_all(&bytes).map_err(|e| io_error(dir, e))?;
    file.as_file().sync_all().map_err(|e| io_error(dir, e))?;
    let path = file.into_temp_path();

    debug!(
        path = %path.display(),
        size = bytes.len(),
        mime = kind.mime_type(),
        "Materialized attachment"
    );

    Ok(AttachmentFile {
        path: Some(path),
        size: bytes.len(),
    })
}

fn io_error(dir: &Path, e: std::io::Error) -> ServerError {
    ServerError::Internal(format!(
        "Failed to write attachment in {}: {e}",
        dir.display()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDRpayload";

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_file_holds_decoded_bytes() {
        let dir = TempDir::new().unwrap();
        let files = materialize(dir.path(), &[STANDARD.encode(PNG_BYTES)]).unwrap();

        assert_eq!(files.len(), 1);
        let file = &files[0];
        assert_eq!(std::fs::read(file.path()).unwrap(), PNG_BYTES);
        assert_eq!(file.size(), PNG_BYTES.len());

        let name = file.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("signald-bridge-"));
        assert!(name.ends_with(".png"));
        assert_eq!(file.as_request().filename, file.path().to_string_lossy());
    }

    #[test]
    fn test_drop_removes_file() {
        let dir = TempDir::new().unwrap();
        let files = materialize(dir.path(), &[STANDARD.encode(PNG_BYTES)]).unwrap();
        let path = files[0].path().to_path_buf();
        assert!(path.exists());

        drop(files);
        assert!(!path.exists());
        assert_eq!(entries(dir.path()), 0);
    }

    #[test]
    fn test_invalid_base64() {
        let dir = TempDir::new().unwrap();
        let err = materialize(dir.path(), &["not base64!".to_string()]).unwrap_err();
        assert!(matches!(err, ServerError::InvalidAttachment(_)));
        assert_eq!(entries(dir.path()), 0);
    }

    #[test]
    fn test_padded_base64_rejected() {
        let dir = TempDir::new().unwrap();
        for blob in [
            format!(" {}", STANDARD.encode(PNG_BYTES)),
            format!("{}\n", STANDARD.encode(PNG_BYTES)),
        ] {
            let err = materialize(dir.path(), &[blob]).unwrap_err();
            assert!(matches!(err, ServerError::InvalidAttachment(_)));
        }
        assert_eq!(entries(dir.path()), 0);
    }

    #[test]
    fn test_unknown_type() {
        let dir = TempDir::new().unwrap();
        let err = materialize(dir.path(), &[STANDARD.encode(b"just some text")]).unwrap_err();
        assert!(matches!(err, ServerError::InvalidAttachment(_)));
    }

    #[test]
    fn test_later_failure_cleans_up_earlier_files() {
        let dir = TempDir::new().unwrap();
        let blobs = vec![
            STANDARD.encode(PNG_BYTES),
            STANDARD.encode(PNG_BYTES),
            "%%%".to_string(),
        ];
        assert!(materialize(dir.path(), &blobs).is_err());
        assert_eq!(entries(dir.path()), 0);
    }

    #[test]
    fn test_empty_input() {
        let dir = TempDir::new().unwrap();
        assert!(materialize(dir.path(), &[]).unwrap().is_empty());
    }
}
