//! Mount plumbing.
//!
//! Builds the fuser mount options from the engine config and runs the
//! session on the calling thread until unmounted or signalled.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use fuser::MountOption;
use nimbus_core::config::FuseConfig;
use nimbus_vfs::Vfs;
use tokio::runtime::Handle;
use tracing::info;

use crate::filesystem::NimbusFs;

/// Mount options for a NimbusFS mount.
pub fn mount_options(config: &FuseConfig) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName(format!("nimbusfs#{}", config.mount_name)),
        MountOption::Subtype("nimbusfs".to_string()),
        MountOption::DefaultPermissions,
        MountOption::NoAtime,
    ];
    if config.kernel_debug {
        options.push(MountOption::CUSTOM("debug".to_string()));
    }
    options
}

/// Mounts the filesystem and blocks until it is unmounted.
///
/// The caller owns the runtime; FUSE dispatch threads cross back into
/// it through the handle.
pub fn mount_and_serve(
    rt: Handle,
    vfs: Arc<Vfs>,
    config: &FuseConfig,
    mountpoint: &Path,
) -> Result<()> {
    let fs = NimbusFs::new(rt, vfs);
    let options = mount_options(config);
    info!(
        mountpoint = %mountpoint.display(),
        max_background = config.max_background,
        "mounting"
    );
    fuser::mount2(fs, mountpoint, &options)
        .with_context(|| format!("failed to mount at {}", mountpoint.display()))?;
    info!("unmounted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_options_shape() {
        let mut config = FuseConfig::default();
        config.mount_name = "work".to_string();
        let options = mount_options(&config);
        assert!(options.contains(&MountOption::FSName("nimbusfs#work".to_string())));
        assert!(options.contains(&MountOption::NoAtime));
        assert!(!options.contains(&MountOption::CUSTOM("debug".to_string())));

        config.kernel_debug = true;
        let options = mount_options(&config);
        assert!(options.contains(&MountOption::CUSTOM("debug".to_string())));
    }
}
