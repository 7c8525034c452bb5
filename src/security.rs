//! Privilege guard shared by the binaries.

use anyhow::{Result, bail};
use nix::unistd::Uid;
use tracing::warn;

/// Fails fast when a binary is started as root. The service only ever writes
/// into its download root and has no reason to hold privileges; a root-owned
/// session tree would also be impossible for an unprivileged sweep to clean.
/// `allow_root` downgrades the refusal to a warning for container images
/// that only ship a root user.
pub fn ensure_not_root(process: &str, allow_root: bool) -> Result<()> {
    if !Uid::current().is_root() {
        return Ok(());
    }
    if allow_root {
        warn!(process, "running as root because --allow-root was given");
        return Ok(());
    }
    bail!("{process} must not be run as root; start it under an unprivileged account");
}
