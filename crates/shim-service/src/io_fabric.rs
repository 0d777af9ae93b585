//! Connects host stdio FIFOs to the agent's process streams (SPEC_FULL.md §4.3).

use crate::model::CloseSignal;
use agent_client::client::ProcessIo;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

const BUFFER_SIZE: usize = 32 * 1024;
const POOL_CAPACITY: usize = 64;

/// Fixed-size 32 KiB buffers, acquired before a copy and returned after.
pub struct BufferPool {
    free: AsyncMutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        let free = (0..POOL_CAPACITY).map(|_| vec![0u8; BUFFER_SIZE]).collect();
        Self { free: AsyncMutex::new(free) }
    }

    pub async fn acquire(&self) -> Vec<u8> {
        let mut free = self.free.lock().await;
        free.pop().unwrap_or_else(|| vec![0u8; BUFFER_SIZE])
    }

    pub async fn release(&self, buf: Vec<u8>) {
        let mut free = self.free.lock().await;
        if free.len() < POOL_CAPACITY {
            free.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

pub struct StdioPathsSpec {
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Opens the named host FIFOs and wires up to three copy tasks between
/// them and the agent's process streams, then signals `exit_io` (and, on
/// the stdin side, `stdin_closer`) once every task has finished.
///
/// A process with no stdio paths at all must still unblock the waiter
/// and `CloseIO`, so both signals are fired immediately in that case.
pub async fn spawn_io(
    pool: Arc<BufferPool>,
    paths: StdioPathsSpec,
    agent_io: ProcessIo,
    exit_io: Arc<CloseSignal>,
    stdin_closer: Arc<CloseSignal>,
) {
    let mut tasks = Vec::new();

    if let (Some(path), Some(mut agent_stdin)) = (paths.stdin, agent_io.stdin) {
        let pool = pool.clone();
        let stdin_closer = stdin_closer.clone();
        tasks.push(tokio::spawn(async move {
            if let Ok(mut host_stdin) = OpenOptions::new().read(true).open(&path).await {
                loop {
                    let mut buf = pool.acquire().await;
                    match host_stdin.read(&mut buf).await {
                        Ok(0) | Err(_) => {
                            pool.release(buf).await;
                            break;
                        }
                        Ok(n) => {
                            let wrote = agent_stdin.write_all(&buf[..n]).await;
                            pool.release(buf).await;
                            if wrote.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            stdin_closer.close();
        }));
    } else {
        stdin_closer.close();
    }

    if let (Some(path), Some(mut agent_stdout)) = (paths.stdout, agent_io.stdout) {
        let pool = pool.clone();
        let stdin_closer = stdin_closer.clone();
        tasks.push(tokio::spawn(async move {
            if let Ok(mut host_stdout) = OpenOptions::new().write(true).open(&path).await {
                loop {
                    let mut buf = pool.acquire().await;
                    match agent_stdout.read(&mut buf).await {
                        Ok(0) | Err(_) => {
                            pool.release(buf).await;
                            break;
                        }
                        Ok(n) => {
                            let wrote = host_stdout.write_all(&buf[..n]).await;
                            pool.release(buf).await;
                            if wrote.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            // stdout ending while stdin is still open would otherwise
            // leave a peer blocked waiting for stdin to close.
            stdin_closer.close();
        }));
    }

    if let (Some(path), Some(mut agent_stderr)) = (paths.stderr, agent_io.stderr) {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            if let Ok(mut host_stderr) = OpenOptions::new().write(true).open(&path).await {
                loop {
                    let mut buf = pool.acquire().await;
                    match agent_stderr.read(&mut buf).await {
                        Ok(0) | Err(_) => {
                            pool.release(buf).await;
                            break;
                        }
                        Ok(n) => {
                            let wrote = host_stderr.write_all(&buf[..n]).await;
                            pool.release(buf).await;
                            if wrote.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }));
    }

    if tasks.is_empty() {
        exit_io.close();
        return;
    }

    for task in tasks {
        let _ = task.await;
    }
    exit_io.close();
}
