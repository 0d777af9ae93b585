//! The external collaborator that owns everything this core explicitly
//! does not: rootfs/mount preparation, CNI wiring, and OCI hook
//! execution (SPEC_FULL.md §1, §6). The core only calls through this
//! trait; a production binary wires a real implementation, tests wire a
//! no-op one.

use async_trait::async_trait;

#[async_trait]
pub trait SandboxManager: Send + Sync {
    /// Prepares `bundle`'s rootfs for the guest, returning true if a
    /// mount was actually performed (block-backed rootfs is a no-op).
    async fn mount_rootfs(&self, bundle: &str) -> std::io::Result<bool>;
    async fn unmount_rootfs(&self, bundle: &str) -> std::io::Result<()>;
    async fn run_post_start_hooks(&self, bundle: &str) -> std::io::Result<()>;
    async fn run_post_stop_hooks(&self, bundle: &str) -> std::io::Result<()>;

    /// Crash-recovery VM teardown invoked by `TaskService::cleanup`; a
    /// no-op by default since most collaborators tear the VM down as a
    /// side effect of `unmount_rootfs`/`run_post_stop_hooks` already.
    async fn cleanup(&self, _bundle: &str) -> std::io::Result<()> {
        Ok(())
    }
}

pub struct NoopSandboxManager;

#[async_trait]
impl SandboxManager for NoopSandboxManager {
    async fn mount_rootfs(&self, _bundle: &str) -> std::io::Result<bool> {
        Ok(false)
    }

    async fn unmount_rootfs(&self, _bundle: &str) -> std::io::Result<()> {
        Ok(())
    }

    async fn run_post_start_hooks(&self, _bundle: &str) -> std::io::Result<()> {
        Ok(())
    }

    async fn run_post_stop_hooks(&self, _bundle: &str) -> std::io::Result<()> {
        Ok(())
    }
}
