//! Guest credential check performed before any guest-side side effect.

use crate::guest::{GuestOperations, GuestOpsError};
use tracing::{debug, info};
use vmexec_common::GuestCredentials;

/// Confirm `auth` is usable on the guest. Not retried.
pub async fn validate_credentials<G>(guest: &G, auth: &GuestCredentials) -> Result<(), GuestOpsError>
where
    G: GuestOperations + ?Sized,
{
    debug!(user = %auth.username, "validating guest credentials");
    guest.validate_credentials(auth).await?;
    info!(user = %auth.username, "guest authentication succeeded");
    Ok(())
}
