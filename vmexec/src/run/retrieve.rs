//! Download of the captured output file.

use super::TransferStepError;
use super::launch::EXIT_MARKER;
use crate::guest::GuestOperations;
use crate::transfer::{Transfer, TransferError};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};
use vmexec_common::util::{redact_url_query, sanitize_file_stem};
use vmexec_common::{GuestCredentials, VmTarget};

/// Bytes read from the end of the output file when looking for the marker.
const MARKER_TAIL_BYTES: u64 = 64;

/// Local file for `target`'s output: `<output_dir>/<target>.txt`.
pub fn output_file_path(output_dir: &Path, target: &VmTarget) -> PathBuf {
    output_dir.join(format!("{}.txt", sanitize_file_stem(target.as_str())))
}

/// Download `guest_path` into `dest`, replacing any existing file.
pub async fn retrieve_output<G, T>(
    guest: &G,
    transfer: &T,
    auth: &GuestCredentials,
    guest_path: &str,
    dest: &Path,
) -> Result<u64, TransferStepError>
where
    G: GuestOperations + ?Sized,
    T: Transfer + ?Sized,
{
    let handle = guest.initiate_download(auth, guest_path).await?;
    let url = guest.resolve_transfer_url(&handle)?;
    debug!(guest_path, url = %redact_url_query(url.as_str()), "download URL issued");

    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| TransferError::LocalWrite {
                path: parent.to_path_buf(),
                source,
            })?;
    }

    let bytes = transfer.download(&url, dest).await?;
    info!(path = %dest.display(), bytes, "output saved");
    Ok(bytes)
}

/// Exit code from a trailing `EXIT:<code>` marker, if the output ends with one.
///
/// The marker is appended with `>>`, so a script whose output lacks a final
/// newline leaves it mid-line (`doneEXIT:3`).
pub fn parse_exit_marker(output: &[u8]) -> Option<i32> {
    let text = String::from_utf8_lossy(output);
    let last_line = text.trim_end().rsplit('\n').next()?;
    let (_, code) = last_line.rsplit_once(EXIT_MARKER)?;
    code.trim().parse().ok()
}

/// Read the tail of a saved output file and parse the exit marker.
pub async fn read_exit_marker(path: &Path) -> Option<i32> {
    let mut file = tokio::fs::File::open(path).await.ok()?;
    let len = file.metadata().await.ok()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(MARKER_TAIL_BYTES)))
        .await
        .ok()?;
    let mut tail = Vec::with_capacity(MARKER_TAIL_BYTES as usize);
    file.read_to_end(&mut tail).await.ok()?;
    parse_exit_marker(&tail)
}
