use delivery_spec::{DeliveryError, DeliveryResult};
use system_utils::ssh::{join_remote, shell_escape};
use tracing::info;
use tunnel_chain::SecureSession;

use crate::archive::LocalArchive;

const REMOTE_ARCHIVE_MODE: u32 = 0o600;

pub(crate) fn remote_archive_path(remote_tmp: &str, archive: &LocalArchive) -> String {
    join_remote(remote_tmp, &archive.file_name())
}

/// Streams the local archive into `remote_path`. Returns the number of bytes sent.
pub(crate) async fn upload_archive(
    session: &dyn SecureSession,
    archive: &LocalArchive,
    remote_path: &str,
) -> DeliveryResult<u64> {
    let mut local = tokio::fs::File::open(archive.path()).await.map_err(|err| {
        DeliveryError::transfer(format!("open {}: {err}", archive.path().display()))
    })?;
    let mut channel = session
        .open_file_channel(remote_path, REMOTE_ARCHIVE_MODE)
        .await?;
    let sent = match tokio::io::copy(&mut local, &mut channel).await {
        Ok(sent) => sent,
        Err(err) => {
            // Let the remote side finish so its error, if any, is not lost.
            let remote = channel.close().await.err();
            let detail = remote.map(|err| format!(" ({err})")).unwrap_or_default();
            return Err(DeliveryError::transfer(format!(
                "upload to {remote_path}: {err}{detail}"
            )));
        }
    };
    channel.close().await?;
    info!(
        event = "upload.done",
        remote_path = %remote_path,
        bytes = sent,
        "archive uploaded"
    );
    Ok(sent)
}

/// Shell script extracting `remote_archive` into a private directory and merging
/// it into `dst`. Files only present in `dst` are kept.
pub(crate) fn unpack_script(remote_archive: &str, dst: &str) -> String {
    let archive = shell_escape(remote_archive);
    let extract_dir = shell_escape(&format!("{remote_archive}_extr"));
    let dst = shell_escape(dst);
    [
        format!("mkdir -p {dst}"),
        "umask 0000".to_string(),
        format!("mkdir -m 0700 -p {extract_dir}"),
        format!("tar zxf {archive} -C {extract_dir}"),
        format!("cp -R {extract_dir}/. {dst}/"),
        format!("rm -rf {archive} {extract_dir}"),
        format!("echo {dst}"),
        format!("ls -alh {dst}"),
    ]
    .join(" && ")
}

pub(crate) async fn unpack_archive(
    session: &dyn SecureSession,
    remote_archive: &str,
    dst: &str,
) -> DeliveryResult<()> {
    let script = unpack_script(remote_archive, dst);
    let status = session.execute(&script).await?;
    if status.success() {
        return Ok(());
    }
    let code = status
        .code
        .map(|code| code.to_string())
        .unwrap_or_else(|| "signal".to_string());
    Err(DeliveryError::command(format!(
        "remote unpack into {dst} exited with {code}"
    )))
}
