//! Download engine process supervision
//!
//! Starts the engine as a child process with an ephemeral RPC port and a
//! one-shot secret, waits until RPC answers, and tears it down on
//! release. The engine is told to exit with us (`--stop-with-process`)
//! so a crashed build does not leave a daemon behind.

use crate::download::rpc::RpcClient;
use crate::error::{ImagerError, ImagerResult};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Engine binary looked up on PATH
pub const ENGINE_BIN: &str = "aria2c";

const READY_ATTEMPTS: u32 = 8;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A running engine child process and its RPC coordinates
pub struct EngineProcess {
    child: Child,
    pub port: u16,
    pub secret: String,
}

impl EngineProcess {
    /// Spawn the engine and wait until its RPC endpoint answers
    pub async fn start() -> ImagerResult<(Self, RpcClient)> {
        let port = free_port()?;
        let secret = uuid::Uuid::new_v4().simple().to_string();

        let child = Command::new(ENGINE_BIN)
            .args([
                "--enable-rpc",
                "--rpc-listen-port",
                &port.to_string(),
                "--rpc-secret",
                &secret,
                "--stop-with-process",
                &std::process::id().to_string(),
                "--quiet",
                "--no-conf",
                "--auto-file-renaming=false",
                "--allow-overwrite=true",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ImagerError::ToolSpawn {
                command: ENGINE_BIN.to_string(),
                source: e,
            })?;

        let process = Self {
            child,
            port,
            secret,
        };
        let rpc = RpcClient::new(port, &process.secret);

        let mut delay = Duration::from_millis(100);
        for attempt in 1..=READY_ATTEMPTS {
            tokio::time::sleep(delay).await;
            if rpc.ping().await.is_ok() {
                debug!(port, attempt, "download engine ready");
                return Ok((process, rpc));
            }
            delay *= 2;
        }
        Err(ImagerError::EngineUnavailable {
            attempts: READY_ATTEMPTS,
        })
    }

    /// Ask the engine to exit, killing it after the grace period
    pub async fn shutdown(&mut self, rpc: &RpcClient) {
        if rpc.shutdown().await.is_err() {
            let _ = rpc.force_shutdown().await;
        }
        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "download engine exited"),
            Ok(Err(e)) => warn!("waiting for download engine: {e}"),
            Err(_) => {
                warn!("download engine did not exit in time, killing it");
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            }
        }
    }
}

/// An ephemeral localhost port the engine can listen on
fn free_port() -> ImagerResult<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
        .map_err(|e| ImagerError::io("finding a free RPC port", e))?;
    let port = listener
        .local_addr()
        .map_err(|e| ImagerError::io("reading RPC port", e))?
        .port();
    Ok(port)
}
