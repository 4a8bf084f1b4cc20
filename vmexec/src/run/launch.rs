//! Detached launch of the staged script.

use crate::guest::{GuestOperations, GuestOpsError};
use tracing::info;
use vmexec_common::{GuestCredentials, ProcessId};

/// Marker appended to the output file with the script's exit status.
pub const EXIT_MARKER: &str = "EXIT:";

/// Program and argument string handed to the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub arguments: String,
}

/// Build the command that runs `script` with all output captured in `output`
/// and the exit status appended as `EXIT:<code>`.
pub fn build_launch_command(shell: &str, script: &str, output: &str, use_sudo: bool) -> LaunchCommand {
    let script_q = shell_escape::escape(script.into());
    let output_q = shell_escape::escape(output.into());
    let sudo = if use_sudo { "sudo " } else { "" };
    let inner = format!(
        "{sudo}{shell} {script_q} > {output_q} 2>&1; echo {EXIT_MARKER}$? >> {output_q}"
    );

    LaunchCommand {
        program: shell.to_string(),
        arguments: format!("-lc {}", shell_escape::escape(inner.into())),
    }
}

/// Start the command and return the guest pid.
pub async fn launch_script<G>(
    guest: &G,
    auth: &GuestCredentials,
    command: &LaunchCommand,
) -> Result<ProcessId, GuestOpsError>
where
    G: GuestOperations + ?Sized,
{
    let pid = guest
        .start_process(auth, &command.program, &command.arguments)
        .await?;
    info!(%pid, "process started");
    Ok(pid)
}
