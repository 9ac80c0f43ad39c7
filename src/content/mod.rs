//! Content orchestration
//!
//! Takes the recipe and produces on-image artifacts, going through the
//! cache first and the download engine for whatever is left. Identical
//! cache keys are fetched at most once per build; every other item
//! waits for the first one's result.

pub mod archive;

use crate::cache::entry::{canonical_source, fingerprint};
use crate::cache::{Admission, CacheEntry, CacheStore, ItemClass, Lookup};
use crate::download::{DownloadRequest, DownloadState, Downloader};
use crate::error::{ImagerError, ImagerResult};
use crate::layout::process::ToolRunner;
use crate::recipe::{FileSpec, OciImageSpec, Recipe, Via};
use crate::ui::{DownloadProgress, UiContext};
use crate::units::format_size;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// External OCI export tool, required only for images without a
/// pre-exported tarball URL
pub const OCI_EXPORT_BIN: &str = "docker-export";

/// The single platform hotspot images are built for
pub const OCI_PLATFORM: &str = "linux/arm64/v8";

/// Poll cadence for download progress
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Validators and size learned from a HEAD pass
#[derive(Debug, Clone, Default)]
pub struct HeadInfo {
    pub size: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Where an artifact ended up coming from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Cache,
    Download,
}

/// Schedules base image, file and OCI fetches through cache and engine
pub struct Orchestrator<'a, D: Downloader> {
    recipe: &'a Recipe,
    cache: Option<&'a mut CacheStore>,
    downloader: &'a mut D,
    build_dir: PathBuf,
    http: reqwest::Client,
    ui: UiContext,
    head_info: HashMap<String, HeadInfo>,
}

impl<'a, D: Downloader> Orchestrator<'a, D> {
    pub fn new(
        recipe: &'a Recipe,
        cache: Option<&'a mut CacheStore>,
        downloader: &'a mut D,
        build_dir: &Path,
        ui: UiContext,
    ) -> Self {
        Self {
            recipe,
            cache,
            downloader,
            build_dir: build_dir.to_path_buf(),
            http: reqwest::Client::new(),
            ui,
            head_info: HashMap::new(),
        }
    }

    /// Validate every remote source with a HEAD request, recording
    /// sizes and validators. Returns the total size of known items.
    pub async fn check_sources(&mut self) -> ImagerResult<u64> {
        let mut urls = vec![self.recipe.base.url()?];
        for file in self.recipe.remote_files() {
            if let Some(url) = &file.url {
                urls.push(url.clone());
            }
        }
        for image in &self.recipe.oci_images {
            if let Some(url) = &image.url {
                urls.push(url.clone());
            }
        }

        let mut total = 0;
        for url in urls {
            let info = self.head(&url).await?;
            if let Some(size) = info.size {
                total += size;
            }
            self.head_info
                .insert(canonical_source(ItemClass::File, &url), info);
        }
        Ok(total)
    }

    async fn head(&self, url: &str) -> ImagerResult<HeadInfo> {
        debug!(url, "checking source");
        let response = self
            .http
            .head(url)
            .send()
            .await
            .map_err(|e| ImagerError::UrlUnreachable {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(ImagerError::UrlUnreachable {
                url: url.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Ok(HeadInfo {
            size: header("content-length").and_then(|v| v.parse().ok()),
            etag: header("etag"),
            last_modified: header("last-modified"),
        })
    }

    /// Ask upstream whether a stale entry is still current. A 304 means
    /// yes; an entry without validators is always considered outdated.
    async fn revalidate(&self, entry: &CacheEntry) -> ImagerResult<bool> {
        if entry.etag.is_none() && entry.last_modified.is_none() {
            return Ok(false);
        }
        let mut request = self.http.get(&entry.source);
        if let Some(etag) = &entry.etag {
            request = request.header("If-None-Match", etag.clone());
        }
        if let Some(last_modified) = &entry.last_modified {
            request = request.header("If-Modified-Since", last_modified.clone());
        }
        let response = request.send().await?;
        Ok(response.status() == reqwest::StatusCode::NOT_MODIFIED)
    }

    /// Fetch the base image and write it, decompressed, to `output`.
    /// Returns the decompressed size.
    pub async fn fetch_base(&mut self, output: &Path) -> ImagerResult<u64> {
        let url = self.recipe.base.url()?;
        let (artifact, provenance) = self
            .obtain(ItemClass::File, &url, None, None, None)
            .await?;
        info!(
            %url,
            cached = provenance == Provenance::Cache,
            "base image ready"
        );

        if url.ends_with(".xz") {
            archive::decompress_xz_image(&artifact, output)
        } else {
            std::fs::copy(&artifact, output)
                .map_err(|e| ImagerError::io(format!("copying base to {}", output.display()), e))
        }
    }

    /// Write inline `content` files onto the mounted data partition.
    /// These never touch the network.
    pub fn place_content_files(&self, data_root: &Path) -> ImagerResult<()> {
        for file in self.recipe.content_files() {
            let Some(bytes) = file.decoded_content()? else {
                continue;
            };
            let dest = file.mounted_to(data_root)?;
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ImagerError::io("creating content directory", e))?;
            }
            std::fs::write(&dest, &bytes)
                .map_err(|e| ImagerError::io(format!("writing {}", dest.display()), e))?;
            info!(to = %file.to.display(), size = bytes.len(), "content written");
        }
        Ok(())
    }

    /// Fetch all `url` files and place them onto the data partition,
    /// expanding archives as requested
    pub async fn fetch_remote_files(&mut self, data_root: &Path) -> ImagerResult<()> {
        // first occurrence per cache key downloads; the rest share it
        let mut artifacts: HashMap<String, PathBuf> = HashMap::new();
        let remote: Vec<FileSpec> = self.recipe.remote_files().cloned().collect();

        for file in &remote {
            let Some(url) = &file.url else { continue };
            let key = fingerprint(&canonical_source(ItemClass::File, url));
            if let Some(existing) = artifacts.get(&key) {
                debug!(%url, "sharing previously fetched artifact");
                let existing = existing.clone();
                self.place_file(file, &existing, data_root)?;
                continue;
            }

            let expected = match file.via {
                Via::Direct => file.size,
                _ => None,
            };
            let (artifact, _) = self
                .obtain(ItemClass::File, url, None, file.checksum.clone(), expected)
                .await?;
            self.place_file(file, &artifact, data_root)?;
            artifacts.insert(key, artifact);
        }
        Ok(())
    }

    fn place_file(&self, file: &FileSpec, artifact: &Path, data_root: &Path) -> ImagerResult<()> {
        let dest = file.mounted_to(data_root)?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ImagerError::io("creating destination directory", e))?;
        }

        if file.via == Via::Direct {
            std::fs::copy(artifact, &dest)
                .map_err(|e| ImagerError::io(format!("copying to {}", dest.display()), e))?;
            info!(to = %file.to.display(), "file placed");
            return Ok(());
        }

        let measured = archive::expand(artifact, file.via, &dest)?;
        if let Some(declared) = file.size {
            if measured > declared {
                return Err(ImagerError::ArchiveTooLarge {
                    measured,
                    declared,
                });
            }
        }
        info!(
            to = %file.to.display(),
            size = %format_size(measured),
            "archive expanded"
        );
        Ok(())
    }

    /// Fetch or export every OCI image and unpack its tarball into the
    /// image's container storage area
    pub async fn fetch_oci_images(
        &mut self,
        data_root: &Path,
        runner: &ToolRunner,
    ) -> ImagerResult<()> {
        if self.recipe.oci_images.is_empty() {
            return Ok(());
        }
        let images_root = data_root.join("images");
        std::fs::create_dir_all(&images_root)
            .map_err(|e| ImagerError::io("creating images directory", e))?;

        let images: Vec<OciImageSpec> = self.recipe.oci_images.clone();
        for image in &images {
            let tarball = match &image.url {
                Some(url) => {
                    self.obtain(
                        ItemClass::OciImage,
                        &image.ident,
                        Some(url.clone()),
                        None,
                        Some(image.filesize),
                    )
                    .await?
                    .0
                }
                None => self.obtain_exported(image, runner).await?,
            };

            let store_dir = images_root.join(fs_name(&image.ident));
            let unpacked = archive::expand(&tarball, Via::Tar, &store_dir)?;
            info!(
                ident = %image.ident,
                size = %format_size(unpacked),
                "OCI image unpacked"
            );
        }
        Ok(())
    }

    /// Produce an exported tarball through the external export tool,
    /// then run it through cache admission like any download
    async fn obtain_exported(
        &mut self,
        image: &OciImageSpec,
        runner: &ToolRunner,
    ) -> ImagerResult<PathBuf> {
        if let Some(path) = self.cache_lookup(ItemClass::OciImage, &image.ident).await? {
            return Ok(path);
        }

        let staging = self.staging_path(ItemClass::OciImage, &image.ident)?;
        let export_dir = self.build_dir.join("oci_export");
        std::fs::create_dir_all(&export_dir)
            .map_err(|e| ImagerError::io("creating export directory", e))?;
        let staging_arg = staging.display().to_string();
        let export_dir_arg = export_dir.display().to_string();
        runner
            .run(
                OCI_EXPORT_BIN,
                &[
                    "--platform",
                    OCI_PLATFORM,
                    "--build-dir",
                    &export_dir_arg,
                    &image.ident,
                    &staging_arg,
                ],
            )
            .await
            .map_err(|e| match e {
                ImagerError::ToolSpawn { .. } => ImagerError::UnknownOciImage(image.ident.clone()),
                other => other,
            })?;

        self.admit(ItemClass::OciImage, &image.ident, staging).await
    }

    /// Cache-or-download one artifact; the returned path is readable
    /// for the rest of the build. `uri` overrides the transfer URL when
    /// it differs from the cache key (OCI tarball mirrors).
    async fn obtain(
        &mut self,
        class: ItemClass,
        source: &str,
        uri: Option<String>,
        checksum: Option<crate::recipe::Checksum>,
        expected_size: Option<u64>,
    ) -> ImagerResult<(PathBuf, Provenance)> {
        if let Some(path) = self.cache_lookup(class, source).await? {
            return Ok((path, Provenance::Cache));
        }

        let staging = self.staging_path(class, source)?;
        let request = DownloadRequest {
            uri: uri.unwrap_or_else(|| source.to_string()),
            out_path: staging.clone(),
            checksum,
            expected_size: expected_size.or_else(|| {
                self.head_info
                    .get(&canonical_source(class, source))
                    .and_then(|info| info.size)
            }),
            headers: vec![],
        };
        self.download_all(vec![request]).await?;

        let path = self.admit(class, source, staging).await?;
        Ok((path, Provenance::Download))
    }

    /// Resolve a source against the cache, handling staleness. Returns
    /// a readable artifact path on hit.
    async fn cache_lookup(
        &mut self,
        class: ItemClass,
        source: &str,
    ) -> ImagerResult<Option<PathBuf>> {
        let lookup = match self.cache.as_deref_mut() {
            None => return Ok(None),
            Some(cache) => cache.lookup(class, source)?,
        };
        match lookup {
            Lookup::Hit(entry, blob) => {
                debug!(source = %entry.source, "cache hit");
                Ok(Some(self.stage_from_cache(&entry, &blob)?))
            }
            Lookup::StaleHit(entry, blob) => {
                if self.revalidate(&entry).await? {
                    debug!(source = %entry.source, "revalidated upstream, still fresh");
                    if let Some(cache) = self.cache.as_deref_mut() {
                        cache.mark_checked(&entry.key)?;
                    }
                    Ok(Some(self.stage_from_cache(&entry, &blob)?))
                } else {
                    debug!(source = %entry.source, "outdated upstream, re-downloading");
                    if let Some(cache) = self.cache.as_deref_mut() {
                        cache.invalidate(&entry.key)?;
                    }
                    Ok(None)
                }
            }
            Lookup::Miss | Lookup::Ignored => Ok(None),
        }
    }

    /// Hard link the blob into the build directory, falling back to a
    /// copy across filesystems
    fn stage_from_cache(&self, entry: &CacheEntry, blob: &Path) -> ImagerResult<PathBuf> {
        let staged = self.staging_path(entry.class, &entry.source)?;
        if staged.exists() {
            return Ok(staged);
        }
        if std::fs::hard_link(blob, &staged).is_err() {
            std::fs::copy(blob, &staged)
                .map_err(|e| ImagerError::io("staging cached artifact", e))?;
        }
        Ok(staged)
    }

    fn staging_path(&self, class: ItemClass, source: &str) -> ImagerResult<PathBuf> {
        let dir = self.build_dir.join("artifacts");
        std::fs::create_dir_all(&dir)
            .map_err(|e| ImagerError::io("creating artifacts directory", e))?;
        Ok(dir.join(fingerprint(&canonical_source(class, source))))
    }

    /// Offer a downloaded artifact to the cache. Admission failures are
    /// non-fatal; the artifact stays usable either way.
    async fn admit(
        &mut self,
        class: ItemClass,
        source: &str,
        staging: PathBuf,
    ) -> ImagerResult<PathBuf> {
        let Some(cache) = self.cache.as_deref_mut() else {
            return Ok(staging);
        };
        let size = std::fs::metadata(&staging)
            .map_err(|e| ImagerError::io("sizing downloaded artifact", e))?
            .len();

        let mut entry = CacheEntry::new(class, source, size);
        if let Some(info) = self.head_info.get(&entry.source) {
            entry.etag = info.etag.clone();
            entry.last_modified = info.last_modified.clone();
        }

        match cache.admit(class, source, &staging, entry) {
            Ok(Admission::Admitted(entry)) => {
                debug!(source, "admitted to cache");
                // the blob moved into the store; keep a readable handle
                // in the build directory
                let blob = cache.blob_path(&entry);
                self.stage_from_cache(&entry, &blob)
            }
            Ok(Admission::Rejected(reason)) => {
                debug!(source, ?reason, "cache admission rejected");
                Ok(staging)
            }
            Err(e) => {
                warn!(source, "cache admission failed: {e}");
                Ok(staging)
            }
        }
    }

    /// Submit a batch and poll it to completion at a bounded cadence,
    /// reporting aggregate progress
    async fn download_all(&mut self, requests: Vec<DownloadRequest>) -> ImagerResult<()> {
        if requests.is_empty() {
            return Ok(());
        }
        let known_total: u64 = requests.iter().filter_map(|r| r.expected_size).sum();
        let mut progress = DownloadProgress::new(&self.ui, known_total);

        let mut pending = Vec::new();
        for request in requests {
            let uri = request.uri.clone();
            let id = self.downloader.submit(request).await?;
            pending.push((id, uri));
        }

        loop {
            let mut done = 0;
            let mut bytes_done = 0;
            let mut total = 0;
            for (id, uri) in &pending {
                let status = self.downloader.status(*id).await?;
                bytes_done += status.bytes_done;
                total += status.total;
                match status.state {
                    DownloadState::Done => done += 1,
                    DownloadState::Failed => {
                        progress.finish(bytes_done);
                        return Err(ImagerError::DownloadFailed {
                            source_url: uri.clone(),
                            reason: status.error.unwrap_or_else(|| "unknown error".to_string()),
                        });
                    }
                    _ => {}
                }
            }
            progress.update(bytes_done, total.max(known_total));
            if done == pending.len() {
                progress.finish(bytes_done);
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Filesystem-safe directory name for an OCI reference
pub fn fs_name(ident: &str) -> String {
    ident
        .chars()
        .map(|c| if c == '/' || c == ':' || c == '@' { '_' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Downloader that serves fixtures from memory and counts submissions
    struct MockDownloader {
        fixtures: HashMap<String, Vec<u8>>,
        submissions: Arc<AtomicUsize>,
        statuses: HashMap<crate::download::ItemId, crate::download::DownloadStatus>,
        next_id: crate::download::ItemId,
    }

    impl MockDownloader {
        fn new(fixtures: &[(&str, &[u8])]) -> Self {
            Self {
                fixtures: fixtures
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_vec()))
                    .collect(),
                submissions: Arc::new(AtomicUsize::new(0)),
                statuses: HashMap::new(),
                next_id: 1,
            }
        }

        fn submission_count(&self) -> usize {
            self.submissions.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Downloader for MockDownloader {
        async fn submit(
            &mut self,
            request: DownloadRequest,
        ) -> ImagerResult<crate::download::ItemId> {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            let body = self
                .fixtures
                .get(&request.uri)
                .cloned()
                .ok_or_else(|| ImagerError::DownloadFailed {
                    source_url: request.uri.clone(),
                    reason: "no fixture".to_string(),
                })?;
            std::fs::create_dir_all(request.out_path.parent().unwrap()).unwrap();
            std::fs::write(&request.out_path, &body).unwrap();
            let id = self.next_id;
            self.next_id += 1;
            self.statuses.insert(
                id,
                crate::download::DownloadStatus {
                    bytes_done: body.len() as u64,
                    total: body.len() as u64,
                    speed: 0,
                    state: DownloadState::Done,
                    error: None,
                    started_on: chrono::Utc::now(),
                    completed_on: Some(chrono::Utc::now()),
                },
            );
            Ok(id)
        }

        async fn status(
            &mut self,
            id: crate::download::ItemId,
        ) -> ImagerResult<crate::download::DownloadStatus> {
            Ok(self.statuses[&id].clone())
        }

        async fn shutdown(&mut self) -> ImagerResult<()> {
            Ok(())
        }
    }

    fn recipe(yaml: &str) -> Recipe {
        Recipe::from_yaml(yaml).unwrap()
    }

    #[tokio::test]
    async fn content_files_need_no_network() {
        let parsed = recipe(
            r#"
base: {source: "1.2.0"}
files:
  - {to: /data/conf/hello.txt, content: "hi\n"}
  - {to: /data/x.bin, content: "base64:AAECAw=="}
"#,
        );
        let mut downloader = MockDownloader::new(&[]);
        let build = tempfile::tempdir().unwrap();
        let data_root = tempfile::tempdir().unwrap();

        let orchestrator = Orchestrator::new(
            &parsed,
            None,
            &mut downloader,
            build.path(),
            UiContext::non_interactive(),
        );
        orchestrator.place_content_files(data_root.path()).unwrap();

        let hello = std::fs::read(data_root.path().join("conf/hello.txt")).unwrap();
        assert_eq!(hello, b"hi\n");
        assert_eq!(hello.len(), 3);
        assert_eq!(
            std::fs::read(data_root.path().join("x.bin")).unwrap(),
            vec![0, 1, 2, 3]
        );
        assert_eq!(downloader.submission_count(), 0);
    }

    #[tokio::test]
    async fn identical_keys_share_one_download() {
        let parsed = recipe(
            r#"
base: {source: "1.2.0"}
files:
  - {to: /data/one.bin, url: "https://h/shared.bin"}
  - {to: /data/two.bin, url: "https://H/shared.bin"}
"#,
        );
        let mut downloader = MockDownloader::new(&[("https://h/shared.bin", b"payload")]);
        let build = tempfile::tempdir().unwrap();
        let data_root = tempfile::tempdir().unwrap();

        let mut orchestrator = Orchestrator::new(
            &parsed,
            None,
            &mut downloader,
            build.path(),
            UiContext::non_interactive(),
        );
        orchestrator
            .fetch_remote_files(data_root.path())
            .await
            .unwrap();

        assert_eq!(
            std::fs::read(data_root.path().join("one.bin")).unwrap(),
            b"payload"
        );
        assert_eq!(
            std::fs::read(data_root.path().join("two.bin")).unwrap(),
            b"payload"
        );
        assert_eq!(downloader.submission_count(), 1);
    }

    #[tokio::test]
    async fn second_build_serves_from_cache() {
        let parsed = recipe(
            r#"
base: {source: "1.2.0"}
files:
  - {to: /data/a.bin, url: "https://h/a.bin"}
"#,
        );
        let cache_dir = tempfile::tempdir().unwrap();
        let data_root = tempfile::tempdir().unwrap();

        for expected_submissions in [1usize, 0] {
            let mut downloader = MockDownloader::new(&[("https://h/a.bin", b"payload")]);
            let mut cache = CacheStore::open(cache_dir.path()).unwrap();
            let build = tempfile::tempdir().unwrap();
            let mut orchestrator = Orchestrator::new(
                &parsed,
                Some(&mut cache),
                &mut downloader,
                build.path(),
                UiContext::non_interactive(),
            );
            orchestrator
                .fetch_remote_files(data_root.path())
                .await
                .unwrap();
            assert_eq!(downloader.submission_count(), expected_submissions);
        }
    }

    #[tokio::test]
    async fn archive_larger_than_declared_fails() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(100);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "big.bin", &[0u8; 100][..])
            .unwrap();
        let tarball = builder.into_inner().unwrap();

        let parsed = recipe(
            r#"
base: {source: "1.2.0"}
files:
  - {to: /data/expanded, url: "https://h/a.tar", via: tar, size: 10}
"#,
        );
        let mut downloader = MockDownloader::new(&[("https://h/a.tar", &tarball)]);
        let build = tempfile::tempdir().unwrap();
        let data_root = tempfile::tempdir().unwrap();

        let mut orchestrator = Orchestrator::new(
            &parsed,
            None,
            &mut downloader,
            build.path(),
            UiContext::non_interactive(),
        );
        let result = orchestrator.fetch_remote_files(data_root.path()).await;
        assert!(matches!(result, Err(ImagerError::ArchiveTooLarge { .. })));
    }

    #[tokio::test]
    async fn base_image_download_and_copy() {
        let parsed = recipe("base: {source: \"https://h/base.img\"}\n");
        let mut downloader = MockDownloader::new(&[("https://h/base.img", b"rawimage")]);
        let build = tempfile::tempdir().unwrap();
        let output = build.path().join("out.img");

        let mut orchestrator = Orchestrator::new(
            &parsed,
            None,
            &mut downloader,
            build.path(),
            UiContext::non_interactive(),
        );
        let size = orchestrator.fetch_base(&output).await.unwrap();
        assert_eq!(size, 8);
        assert_eq!(std::fs::read(&output).unwrap(), b"rawimage");
    }

    #[test]
    fn fs_name_sanitises() {
        assert_eq!(
            fs_name("ghcr.io/offspot/kiwix-serve:3.5.0"),
            "ghcr.io_offspot_kiwix-serve_3.5.0"
        );
    }
}
