//! Upload of the script payload into the guest filesystem.

use super::TransferStepError;
use crate::guest::GuestOperations;
use crate::transfer::Transfer;
use tracing::{debug, info};
use vmexec_common::util::redact_url_query;
use vmexec_common::{GuestCredentials, PosixFileAttributes};

/// Upload `script` to `path` with `attrs`, overwriting any existing file.
///
/// Returns the number of bytes uploaded, which always equals `script.len()`.
pub async fn stage_script<G, T>(
    guest: &G,
    transfer: &T,
    auth: &GuestCredentials,
    path: &str,
    attrs: &PosixFileAttributes,
    script: &[u8],
) -> Result<u64, TransferStepError>
where
    G: GuestOperations + ?Sized,
    T: Transfer + ?Sized,
{
    let size = script.len() as u64;
    let handle = guest
        .initiate_upload(auth, path, attrs, size, true)
        .await?;
    let url = guest.resolve_transfer_url(&handle)?;
    debug!(path, url = %redact_url_query(url.as_str()), "upload URL issued");

    let uploaded = transfer.upload(&url, script).await?;
    info!(path, bytes = uploaded, "script uploaded");
    Ok(uploaded)
}
