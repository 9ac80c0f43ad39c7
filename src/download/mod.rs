//! External download engine supervision and RPC client

pub mod client;
pub mod engine;
pub mod rpc;

pub use client::{
    DownloadRequest, DownloadState, DownloadStatus, Downloader, EngineClient, ItemId,
};
pub use engine::{EngineProcess, ENGINE_BIN};
