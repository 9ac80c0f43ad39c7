//! JSON-RPC wire surface of the download engine
//!
//! The engine is an aria2-style daemon speaking JSON-RPC 2.0 over HTTP.
//! Numeric fields arrive as decimal strings on this wire; they are
//! parsed at the edge so the rest of the crate only sees integers.

use crate::error::{ImagerError, ImagerResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Engine-side download states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Active,
    Waiting,
    Paused,
    Complete,
    Error,
    Removed,
}

/// `tellStatus` response, reduced to the fields the client consumes
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TellStatus {
    pub status: EngineState,

    #[serde(default, deserialize_with = "de_string_u64")]
    pub total_length: u64,

    #[serde(default, deserialize_with = "de_string_u64")]
    pub completed_length: u64,

    #[serde(default, deserialize_with = "de_string_u64")]
    pub download_speed: u64,

    #[serde(default)]
    pub error_code: Option<String>,

    #[serde(default)]
    pub error_message: Option<String>,
}

/// `getGlobalStat` response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStat {
    #[serde(default, deserialize_with = "de_string_u64")]
    pub download_speed: u64,

    #[serde(default, deserialize_with = "de_string_u64")]
    pub num_active: u64,
}

/// Per-download options submitted with `addUri`
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubmitOptions {
    /// Download directory
    pub dir: String,

    /// Output file name inside `dir`
    pub out: String,

    /// `algo-name=hex` checksum the engine verifies on completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    /// Extra request headers, `Name: value` lines
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub header: Vec<String>,

    #[serde(rename = "max-tries")]
    pub max_tries: u32,
}

#[derive(Serialize)]
struct RpcRequest {
    jsonrpc: &'static str,
    id: String,
    method: String,
    params: Vec<Value>,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// HTTP JSON-RPC client bound to one engine instance
pub struct RpcClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

impl RpcClient {
    pub fn new(port: u16, secret: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: format!("http://127.0.0.1:{port}/jsonrpc"),
            token: format!("token:{secret}"),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        mut params: Vec<Value>,
    ) -> ImagerResult<T> {
        // the secret token is always the first positional parameter
        params.insert(0, Value::String(self.token.clone()));
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: uuid::Uuid::new_v4().to_string(),
            method: format!("aria2.{method}"),
            params,
        };
        let response: RpcResponse<T> = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await?
            .json()
            .await?;
        if let Some(error) = response.error {
            return Err(ImagerError::DownloadFailed {
                source_url: self.endpoint.clone(),
                reason: format!("rpc error {}: {}", error.code, error.message),
            });
        }
        response.result.ok_or_else(|| ImagerError::DownloadFailed {
            source_url: self.endpoint.clone(),
            reason: "rpc response without result".to_string(),
        })
    }

    /// Probe that the RPC endpoint is up
    pub async fn ping(&self) -> ImagerResult<()> {
        let _: Value = self.call("getVersion", vec![]).await?;
        Ok(())
    }

    /// Queue a download; returns the engine's handle (gid)
    pub async fn add_uri(&self, uri: &str, options: &SubmitOptions) -> ImagerResult<String> {
        self.call(
            "addUri",
            vec![json!([uri]), serde_json::to_value(options)?],
        )
        .await
    }

    pub async fn tell_status(&self, gid: &str) -> ImagerResult<TellStatus> {
        self.call("tellStatus", vec![json!(gid)]).await
    }

    pub async fn get_global_stat(&self) -> ImagerResult<GlobalStat> {
        self.call("getGlobalStat", vec![]).await
    }

    pub async fn remove(&self, gid: &str) -> ImagerResult<()> {
        let _: Value = self.call("remove", vec![json!(gid)]).await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> ImagerResult<()> {
        let _: Value = self.call("shutdown", vec![]).await?;
        Ok(())
    }

    pub async fn force_shutdown(&self) -> ImagerResult<()> {
        let _: Value = self.call("forceShutdown", vec![]).await?;
        Ok(())
    }
}

fn de_string_u64<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    use serde::de::Error as _;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(0),
        Some(Raw::Number(value)) => Ok(value),
        Some(Raw::Text(text)) => text
            .parse()
            .map_err(|_| D::Error::custom(format!("not a number: `{text}`"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tell_status_parses_wire_strings() {
        let status: TellStatus = serde_json::from_str(
            r#"{
                "status": "active",
                "totalLength": "1048576",
                "completedLength": "524288",
                "downloadSpeed": "2048"
            }"#,
        )
        .unwrap();
        assert_eq!(status.status, EngineState::Active);
        assert_eq!(status.total_length, 1048576);
        assert_eq!(status.completed_length, 524288);
        assert_eq!(status.download_speed, 2048);
        assert!(status.error_code.is_none());
    }

    #[test]
    fn tell_status_parses_error() {
        let status: TellStatus = serde_json::from_str(
            r#"{"status": "error", "errorCode": "22", "errorMessage": "bad header"}"#,
        )
        .unwrap();
        assert_eq!(status.status, EngineState::Error);
        assert_eq!(status.error_code.as_deref(), Some("22"));
    }

    #[test]
    fn submit_options_skip_absent_fields() {
        let options = SubmitOptions {
            dir: "/tmp/dl".to_string(),
            out: "file.zim".to_string(),
            checksum: None,
            header: vec![],
            max_tries: 5,
        };
        let value = serde_json::to_value(&options).unwrap();
        assert!(value.get("checksum").is_none());
        assert!(value.get("header").is_none());
        assert_eq!(value["max-tries"], 5);
    }

    #[test]
    fn submit_options_carry_checksum() {
        let options = SubmitOptions {
            dir: "/tmp".into(),
            out: "x".into(),
            checksum: Some("sha-256=abcd".to_string()),
            header: vec!["If-None-Match: \"tag\"".to_string()],
            max_tries: 5,
        };
        let value = serde_json::to_value(&options).unwrap();
        assert_eq!(value["checksum"], "sha-256=abcd");
        assert_eq!(value["header"][0], "If-None-Match: \"tag\"");
    }
}
