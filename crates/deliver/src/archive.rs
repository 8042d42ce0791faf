use std::fs::{self, File};
use std::path::{Path, PathBuf};

use delivery_spec::{DeliveryError, DeliveryResult};
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, warn};

/// Gzip'd tarball in the delivery's working directory. Deleted when dropped.
#[derive(Debug)]
pub(crate) struct LocalArchive {
    path: PathBuf,
    size: u64,
}

impl LocalArchive {
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub(crate) fn remove(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(archive = %self.path.display(), "local archive removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                archive = %self.path.display(),
                error = %err,
                "failed to remove local archive"
            ),
        }
    }
}

impl Drop for LocalArchive {
    fn drop(&mut self) {
        self.remove();
    }
}

pub(crate) fn archive_path_in(work_dir: &Path) -> PathBuf {
    let name = uuid::Uuid::new_v4().simple().to_string();
    work_dir.join(format!("{name}.tgz"))
}

/// Archives every top-level entry of `src_dir` (each recursively) into `dest`.
/// Symlinks are stored as links.
pub(crate) async fn create_archive(src_dir: &Path, dest: PathBuf) -> DeliveryResult<LocalArchive> {
    let src_dir = src_dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let result = write_archive(&src_dir, &dest);
        if result.is_err() {
            let _ = fs::remove_file(&dest);
        }
        result.map(|size| LocalArchive { path: dest, size })
    })
    .await
    .map_err(|err| DeliveryError::transfer(format!("archive task failed: {err}")))?
}

fn write_archive(src_dir: &Path, dest: &Path) -> DeliveryResult<u64> {
    let metadata = fs::metadata(src_dir).map_err(|err| {
        DeliveryError::transfer(format!("source {}: {err}", src_dir.display()))
    })?;
    if !metadata.is_dir() {
        return Err(DeliveryError::transfer(format!(
            "source {} is not a directory",
            src_dir.display()
        )));
    }
    let mut entries = fs::read_dir(src_dir)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .map_err(|err| DeliveryError::transfer(format!("read {}: {err}", src_dir.display())))?;
    entries.sort_by_key(|entry| entry.file_name());

    let file = File::create(dest)
        .map_err(|err| DeliveryError::transfer(format!("create {}: {err}", dest.display())))?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);
    for entry in entries {
        let path = entry.path();
        let name = entry.file_name();
        let is_dir = entry
            .file_type()
            .map(|kind| kind.is_dir())
            .map_err(|err| DeliveryError::transfer(format!("stat {}: {err}", path.display())))?;
        let appended = if is_dir {
            builder.append_dir_all(&name, &path)
        } else {
            builder.append_path_with_name(&path, &name)
        };
        appended.map_err(|err| {
            DeliveryError::transfer(format!("archive {}: {err}", path.display()))
        })?;
    }
    let encoder = builder
        .into_inner()
        .map_err(|err| DeliveryError::transfer(format!("finish archive: {err}")))?;
    let file = encoder
        .finish()
        .map_err(|err| DeliveryError::transfer(format!("finish archive: {err}")))?;
    file.sync_all()
        .map_err(|err| DeliveryError::transfer(format!("sync {}: {err}", dest.display())))?;
    let size = file
        .metadata()
        .map_err(|err| DeliveryError::transfer(format!("stat {}: {err}", dest.display())))?
        .len();
    Ok(size)
}
