//! The containerd-invoked `StartShim` sequence (SPEC_FULL.md §6):
//! computes the listening socket path, binds it and a sibling control
//! socket, self-execs this binary as the long-running server with those
//! sockets inherited on fixed fds, and records `address`/`shim.pid` in
//! the bundle directory.

use std::fs;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Fixed fd the re-exec'd server reads the task-RPC listener from.
pub const TASK_FD_NO: RawFd = 3;
/// Fixed fd the re-exec'd server reads the debug-control listener from.
pub const CONTROL_FD_NO: RawFd = 4;

/// Where this sandbox's sockets live. One directory per namespace keeps
/// ids from different namespaces from colliding on disk.
fn socket_base(namespace: &str, id: &str) -> PathBuf {
    let run_dir = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/run".to_string());
    PathBuf::from(run_dir).join("containerd-shim").join(namespace).join(id)
}

fn bind_fresh(path: &Path) -> io::Result<StdUnixListener> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let _ = fs::remove_file(path);
    StdUnixListener::bind(path)
}

fn dup_onto(from: RawFd, to: RawFd) -> io::Result<()> {
    if from != to && unsafe { libc::dup2(from, to) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Binds the sockets, self-execs the server with them inherited, writes
/// `address`/`shim.pid` into `bundle`, and returns the address string
/// containerd expects on the bootstrap invocation's stdout.
pub fn start(namespace: &str, id: &str, bundle: &Path, server_marker_env: &str) -> io::Result<String> {
    let base = socket_base(namespace, id);
    let task_socket = base.with_extension("sock");
    let control_socket = base.with_extension("ctl.sock");

    let task_listener = bind_fresh(&task_socket)?;
    let control_listener = bind_fresh(&control_socket)?;
    let task_fd = task_listener.as_raw_fd();
    let control_fd = control_listener.as_raw_fd();

    let exe = std::env::current_exe()?;
    let mut cmd = Command::new(exe);
    cmd.args(std::env::args_os().skip(1));
    cmd.env(server_marker_env, "1");
    cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
    // SAFETY: only async-signal-safe calls (dup2, setsid) run between
    // fork and exec, as required by `pre_exec`'s contract.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }
            dup_onto(task_fd, TASK_FD_NO)?;
            dup_onto(control_fd, CONTROL_FD_NO)?;
            Ok(())
        });
    }
    let child = cmd.spawn()?;

    // The child's fork-time copy of these fds survives past our `drop`;
    // our own copies are just bootstrap bookkeeping past this point.
    drop(task_listener);
    drop(control_listener);

    let address = format!("unix://{}", task_socket.display());
    fs::write(bundle.join("address"), &address)?;
    fs::write(bundle.join("shim.pid"), child.id().to_string())?;
    Ok(address)
}

/// Removes the socket and bookkeeping files for a sandbox that has
/// already been torn down. Safe to call even if nothing exists.
pub fn delete(namespace: &str, id: &str, bundle: &Path) -> io::Result<()> {
    let base = socket_base(namespace, id);
    let _ = fs::remove_file(base.with_extension("sock"));
    let _ = fs::remove_file(base.with_extension("ctl.sock"));
    let _ = fs::remove_file(bundle.join("address"));
    let _ = fs::remove_file(bundle.join("shim.pid"));
    Ok(())
}

/// Reconstructs a tokio listener from an fd the parent dup'd in for us.
pub fn listener_from_fd(fd: RawFd) -> tokio::net::UnixListener {
    let std_listener = unsafe { StdUnixListener::from_raw_fd(fd) };
    std_listener.set_nonblocking(true).expect("inherited shim socket must support non-blocking mode");
    tokio::net::UnixListener::from_std(std_listener).expect("inherited shim socket must register with tokio")
}
