//! Download client normalising engine behaviour
//!
//! Wraps the engine RPC into per-item handles with a unified status:
//! totals never regress `bytes_done`, the first non-zero total wins
//! (recipe-declared before engine-reported), timestamps the engine
//! omits are substituted with client-side instants, transient failures
//! are retried a bounded number of times, and declared sha-256
//! checksums are re-verified locally.

use crate::download::engine::EngineProcess;
use crate::download::rpc::{EngineState, RpcClient, SubmitOptions, TellStatus};
use crate::error::{ImagerError, ImagerResult};
use crate::recipe::Checksum;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Bounded retries for transient network failures
pub const MAX_ATTEMPTS: u32 = 3;

/// One download to submit
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub uri: String,
    pub out_path: PathBuf,
    pub checksum: Option<Checksum>,
    pub expected_size: Option<u64>,
    /// Extra request headers, `Name: value`
    pub headers: Vec<String>,
}

/// Client-side handle for a submitted item
pub type ItemId = u64;

/// Normalised item state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Queued,
    Active,
    Paused,
    Done,
    Failed,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Unified status of one item
#[derive(Debug, Clone)]
pub struct DownloadStatus {
    pub bytes_done: u64,
    pub total: u64,
    pub speed: u64,
    pub state: DownloadState,
    pub error: Option<String>,
    pub started_on: DateTime<Utc>,
    pub completed_on: Option<DateTime<Utc>>,
}

/// Seam between the orchestrator and the engine, mockable in tests
#[async_trait]
pub trait Downloader {
    async fn submit(&mut self, request: DownloadRequest) -> ImagerResult<ItemId>;
    async fn status(&mut self, id: ItemId) -> ImagerResult<DownloadStatus>;
    async fn shutdown(&mut self) -> ImagerResult<()>;
}

struct Track {
    request: DownloadRequest,
    gid: String,
    attempts: u32,
    started_on: DateTime<Utc>,
    completed_on: Option<DateTime<Utc>>,
    sticky_total: u64,
    max_done: u64,
    terminal: Option<DownloadStatus>,
}

/// Engine-backed downloader
pub struct EngineClient {
    process: EngineProcess,
    rpc: RpcClient,
    items: HashMap<ItemId, Track>,
    next_id: ItemId,
}

impl EngineClient {
    /// Spawn the engine and return a ready client
    pub async fn start() -> ImagerResult<Self> {
        let (process, rpc) = EngineProcess::start().await?;
        Ok(Self {
            process,
            rpc,
            items: HashMap::new(),
            next_id: 1,
        })
    }

    fn submit_options(request: &DownloadRequest) -> SubmitOptions {
        SubmitOptions {
            dir: request
                .out_path
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| ".".to_string()),
            out: request
                .out_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "download".to_string()),
            checksum: request
                .checksum
                .as_ref()
                .and_then(|c| engine_checksum_name(&c.algo).map(|n| format!("{n}={}", c.hex))),
            header: request.headers.clone(),
            max_tries: 5,
        }
    }
}

#[async_trait]
impl Downloader for EngineClient {
    async fn submit(&mut self, request: DownloadRequest) -> ImagerResult<ItemId> {
        if let Some(parent) = request.out_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ImagerError::io("creating download directory", e))?;
        }
        let gid = self
            .rpc
            .add_uri(&request.uri, &Self::submit_options(&request))
            .await?;
        debug!(uri = %request.uri, %gid, "download submitted");

        let id = self.next_id;
        self.next_id += 1;
        self.items.insert(
            id,
            Track {
                sticky_total: request.expected_size.unwrap_or(0),
                request,
                gid,
                attempts: 1,
                // the engine reports no timestamps; ours are authoritative
                started_on: Utc::now(),
                completed_on: None,
                max_done: 0,
                terminal: None,
            },
        );
        Ok(id)
    }

    async fn status(&mut self, id: ItemId) -> ImagerResult<DownloadStatus> {
        let track = self
            .items
            .get_mut(&id)
            .ok_or_else(|| ImagerError::DownloadFailed {
                source_url: format!("item #{id}"),
                reason: "unknown download handle".to_string(),
            })?;
        if let Some(status) = &track.terminal {
            return Ok(status.clone());
        }

        let tell = self.rpc.tell_status(&track.gid).await?;
        let mut status = fold_status(track, &tell, Utc::now());

        match status.state {
            DownloadState::Done => {
                if let Some(checksum) = track.request.checksum.clone() {
                    if checksum.algo == "sha256" {
                        if let Err(e) = verify_sha256(&track.request.out_path, &checksum.hex) {
                            warn!(uri = %track.request.uri, "checksum mismatch");
                            status.state = DownloadState::Failed;
                            status.error = Some(e.to_string());
                        }
                    }
                }
                track.terminal = Some(status.clone());
            }
            DownloadState::Failed => {
                let transient = tell
                    .error_code
                    .as_deref()
                    .map(|code| !is_fatal_code(code))
                    .unwrap_or(true);
                if transient && track.attempts < MAX_ATTEMPTS {
                    track.attempts += 1;
                    debug!(
                        uri = %track.request.uri,
                        attempt = track.attempts,
                        "retrying transient download failure"
                    );
                    let _ = self.rpc.remove(&track.gid).await;
                    track.gid = self
                        .rpc
                        .add_uri(&track.request.uri, &Self::submit_options(&track.request))
                        .await?;
                    status.state = DownloadState::Queued;
                    status.error = None;
                    status.completed_on = None;
                    track.completed_on = None;
                } else {
                    track.terminal = Some(status.clone());
                }
            }
            _ => {}
        }
        Ok(status)
    }

    async fn shutdown(&mut self) -> ImagerResult<()> {
        self.process.shutdown(&self.rpc).await;
        Ok(())
    }
}

/// Merge one engine report into the track, keeping totals sticky and
/// progress monotonic
fn fold_status(track: &mut Track, tell: &TellStatus, now: DateTime<Utc>) -> DownloadStatus {
    if track.sticky_total == 0 && tell.total_length > 0 {
        track.sticky_total = tell.total_length;
    }
    track.max_done = track.max_done.max(tell.completed_length);

    let state = match tell.status {
        EngineState::Waiting => DownloadState::Queued,
        EngineState::Active => DownloadState::Active,
        EngineState::Paused => DownloadState::Paused,
        EngineState::Complete => DownloadState::Done,
        EngineState::Error | EngineState::Removed => DownloadState::Failed,
    };

    if state == DownloadState::Done && track.completed_on.is_none() {
        track.completed_on = Some(now);
        // a completed item is fully transferred even if the engine
        // under-reported along the way
        if track.sticky_total > 0 {
            track.max_done = track.sticky_total;
        }
    }

    let error = match state {
        DownloadState::Failed => Some(describe_error(
            tell.error_code.as_deref(),
            tell.error_message.as_deref(),
        )),
        _ => None,
    };

    DownloadStatus {
        bytes_done: track.max_done,
        total: track.sticky_total,
        speed: tell.download_speed,
        state,
        error,
        started_on: track.started_on,
        completed_on: track.completed_on,
    }
}

/// Engine-side checksum option name for a recipe algo
fn engine_checksum_name(algo: &str) -> Option<&'static str> {
    match algo {
        "sha256" => Some("sha-256"),
        "sha1" => Some("sha-1"),
        "md5" => Some("md5"),
        _ => None,
    }
}

/// Error codes that no retry will fix: resource missing, client errors,
/// auth failures, checksum mismatches
fn is_fatal_code(code: &str) -> bool {
    matches!(code, "3" | "4" | "22" | "24" | "32")
}

/// Human text for an engine failure, falling back to the known exit
/// code meanings when the engine sends no message
fn describe_error(code: Option<&str>, message: Option<&str>) -> String {
    if let Some(message) = message.filter(|m| !m.is_empty()) {
        return message.to_string();
    }
    let meaning = match code {
        Some("1") => "an unknown error occurred",
        Some("2") => "a timeout occurred",
        Some("3") => "the resource was not found",
        Some("4") => "the resource was repeatedly not found",
        Some("6") => "a network problem occurred",
        Some("9") => "not enough disk space",
        Some("19") => "name resolution failed",
        Some("22") => "the HTTP response was bad or unexpected",
        Some("23") => "too many redirects",
        Some("24") => "HTTP authorization failed",
        Some("29") => "the server was temporarily overloaded",
        Some("32") => "checksum validation failed",
        _ => "unknown error",
    };
    match code {
        Some(code) => format!("error #{code}: {meaning}"),
        None => meaning.to_string(),
    }
}

/// Verify a file against a declared sha-256 hex digest
pub fn verify_sha256(path: &std::path::Path, expected_hex: &str) -> ImagerResult<()> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| ImagerError::io(format!("opening {}", path.display()), e))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .map_err(|e| ImagerError::io(format!("hashing {}", path.display()), e))?;
    let actual = hex::encode(hasher.finalize());
    if actual != expected_hex.to_ascii_lowercase() {
        return Err(ImagerError::ChecksumMismatch {
            source_url: path.display().to_string(),
            expected: expected_hex.to_ascii_lowercase(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn track(expected_size: Option<u64>) -> Track {
        Track {
            request: DownloadRequest {
                uri: "https://h/x".to_string(),
                out_path: PathBuf::from("/tmp/x"),
                checksum: None,
                expected_size,
                headers: vec![],
            },
            gid: "gid1".to_string(),
            attempts: 1,
            started_on: Utc::now(),
            completed_on: None,
            sticky_total: expected_size.unwrap_or(0),
            max_done: 0,
            terminal: None,
        }
    }

    fn tell(status: EngineState, total: u64, done: u64) -> TellStatus {
        serde_json::from_value(serde_json::json!({
            "status": match status {
                EngineState::Active => "active",
                EngineState::Waiting => "waiting",
                EngineState::Paused => "paused",
                EngineState::Complete => "complete",
                EngineState::Error => "error",
                EngineState::Removed => "removed",
            },
            "totalLength": total.to_string(),
            "completedLength": done.to_string(),
            "downloadSpeed": "100",
        }))
        .unwrap()
    }

    #[test]
    fn recipe_size_wins_over_engine_total() {
        let mut item = track(Some(5000));
        let status = fold_status(&mut item, &tell(EngineState::Active, 4096, 10), Utc::now());
        assert_eq!(status.total, 5000);
    }

    #[test]
    fn first_nonzero_engine_total_sticks() {
        let mut item = track(None);
        fold_status(&mut item, &tell(EngineState::Active, 0, 0), Utc::now());
        let status = fold_status(&mut item, &tell(EngineState::Active, 4096, 10), Utc::now());
        assert_eq!(status.total, 4096);
        // later revisions don't replace it
        let status = fold_status(&mut item, &tell(EngineState::Active, 9999, 20), Utc::now());
        assert_eq!(status.total, 4096);
    }

    #[test]
    fn bytes_done_never_regresses() {
        let mut item = track(None);
        fold_status(&mut item, &tell(EngineState::Active, 100, 80), Utc::now());
        let status = fold_status(&mut item, &tell(EngineState::Active, 100, 50), Utc::now());
        assert_eq!(status.bytes_done, 80);
    }

    #[test]
    fn completion_substitutes_client_timestamp() {
        let mut item = track(Some(100));
        let before = Utc::now();
        let status = fold_status(&mut item, &tell(EngineState::Complete, 100, 100), Utc::now());
        let completed = status.completed_on.unwrap();
        assert!(completed >= before);
        assert!(completed >= status.started_on);
        assert_eq!(status.state, DownloadState::Done);
    }

    #[test]
    fn completion_timestamp_is_sticky() {
        let mut item = track(Some(100));
        let first = fold_status(&mut item, &tell(EngineState::Complete, 100, 100), Utc::now())
            .completed_on
            .unwrap();
        let second = fold_status(
            &mut item,
            &tell(EngineState::Complete, 100, 100),
            Utc::now() + chrono::Duration::seconds(5),
        )
        .completed_on
        .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn error_status_carries_message() {
        let mut item = track(None);
        let tell: TellStatus = serde_json::from_value(serde_json::json!({
            "status": "error", "errorCode": "19"
        }))
        .unwrap();
        let status = fold_status(&mut item, &tell, Utc::now());
        assert_eq!(status.state, DownloadState::Failed);
        assert!(status.error.unwrap().contains("name resolution"));
    }

    #[test]
    fn fatal_codes() {
        for code in ["3", "4", "22", "24", "32"] {
            assert!(is_fatal_code(code), "{code} should be fatal");
        }
        for code in ["1", "2", "6", "19", "29"] {
            assert!(!is_fatal_code(code), "{code} should be transient");
        }
    }

    #[test]
    fn checksum_names() {
        assert_eq!(engine_checksum_name("sha256"), Some("sha-256"));
        assert_eq!(engine_checksum_name("md5"), Some("md5"));
        assert_eq!(engine_checksum_name("crc32"), None);
    }

    #[test]
    fn sha256_verification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"hello").unwrap();
        drop(file);

        let good = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        verify_sha256(&path, good).unwrap();
        verify_sha256(&path, &good.to_ascii_uppercase()).unwrap();
        assert!(matches!(
            verify_sha256(&path, &good.replace('2', "3")),
            Err(ImagerError::ChecksumMismatch { .. })
        ));
    }
}
