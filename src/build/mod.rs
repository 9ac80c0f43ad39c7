//! Build driver
//!
//! Wires every subsystem into the linear pipeline: requirements →
//! recipe → cache → source checks → base image → partition work →
//! population → boot config → optional shrink. Owns every resource that
//! needs releasing and unwinds them in reverse order of acquisition,
//! on success, failure and cancellation alike.

use crate::cache::CacheStore;
use crate::cli::Cli;
use crate::content::Orchestrator;
use crate::download::{DownloadRequest, DownloadStatus, Downloader, EngineClient, ItemId};
use crate::error::{ImagerError, ImagerResult};
use crate::layout::process::ToolRunner;
use crate::layout::ImageLayout;
use crate::recipe::{OutputSize, Recipe};
use crate::tools::Requirements;
use crate::ui::{TaskSpinner, UiContext};
use crate::units::{format_size, parse_size};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Explicit sizes snap the image to whole backup-friendly steps; `auto`
/// rounds the decompressed base up to this boundary
const SIZE_ALIGNMENT: u64 = 64 * 1024 * 1024;

/// Validated command-line options
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub config_src: String,
    pub output: PathBuf,
    pub build_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub show_cache: bool,
    pub check: bool,
    pub keep: bool,
    pub overwrite: bool,
    pub max_size: Option<u64>,
    pub debug: bool,
}

impl BuildOptions {
    pub fn from_cli(cli: Cli) -> ImagerResult<Self> {
        let max_size = cli.max_size.as_deref().map(parse_size).transpose()?;
        Ok(Self {
            config_src: cli.config_src,
            output: cli.output,
            build_dir: cli.build_dir,
            cache_dir: cli.cache_dir,
            show_cache: cli.show_cache,
            check: cli.check,
            keep: cli.keep,
            overwrite: cli.overwrite,
            max_size,
            debug: cli.debug,
        })
    }
}

/// Per-build context threaded through the subsystems
pub struct BuildContext {
    pub options: BuildOptions,
    pub build_dir: PathBuf,
    pub runner: ToolRunner,
    pub ui: UiContext,
    _build_dir_guard: Option<TempDir>,
}

impl BuildContext {
    pub fn new(options: BuildOptions) -> ImagerResult<Self> {
        let runner = ToolRunner::new(options.debug);
        let ui = UiContext::detect();
        let (build_dir, guard) = match &options.build_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .map_err(|e| ImagerError::io("creating build directory", e))?;
                (dir.clone(), None)
            }
            None => {
                // honours TMPDIR
                let tmp = tempfile::Builder::new()
                    .prefix("hotspot-imager_")
                    .tempdir()
                    .map_err(|e| ImagerError::io("creating build directory", e))?;
                (tmp.path().to_path_buf(), Some(tmp))
            }
        };
        Ok(Self {
            options,
            build_dir,
            runner,
            ui,
            _build_dir_guard: guard,
        })
    }
}

/// Run a full build, honouring user interrupts
pub async fn run(options: BuildOptions) -> ImagerResult<()> {
    let ctx = BuildContext::new(options)?;
    let mut build = Build::new(ctx);
    let result = tokio::select! {
        result = build.drive() => result,
        _ = tokio::signal::ctrl_c() => Err(ImagerError::Cancelled),
    };
    build.finish(result).await
}

/// One build and the resources it owns
pub struct Build {
    ctx: BuildContext,
    cache: Option<CacheStore>,
    engine: Option<EngineClient>,
    layout: Option<ImageLayout>,
    output_created: bool,
    succeeded: bool,
}

impl Build {
    pub fn new(ctx: BuildContext) -> Self {
        Self {
            ctx,
            cache: None,
            engine: None,
            layout: None,
            output_created: false,
            succeeded: false,
        }
    }

    /// The pipeline. Resources acquired here are stored on `self` so
    /// `finish` can release them even when this future is dropped by a
    /// cancellation.
    pub async fn drive(&mut self) -> ImagerResult<()> {
        let ui = self.ctx.ui;
        let mut step = TaskSpinner::new(&ui);

        step.start(&format!("Reading recipe from {}", self.ctx.options.config_src));
        let recipe = match self.load_recipe().await {
            Ok(recipe) => {
                step.stop("Recipe loaded");
                recipe
            }
            Err(e) => {
                step.stop_error("Recipe unusable");
                return Err(e);
            }
        };

        if let OutputSize::Bytes(size) = recipe.output.size {
            guard_max_size(self.ctx.options.max_size, size)?;
        }

        let output = self.ctx.options.output.clone();
        if !self.ctx.options.check && output.exists() {
            if !self.ctx.options.overwrite {
                return Err(ImagerError::OutputExists(output));
            }
            std::fs::remove_file(&output)
                .map_err(|e| ImagerError::io("removing previous output", e))?;
        }

        if !self.ctx.options.check {
            let needs_export = recipe.oci_images.iter().any(|image| image.url.is_none());
            let extra: &[&str] = if needs_export {
                &[crate::content::OCI_EXPORT_BIN]
            } else {
                &[]
            };
            step.start("Checking system requirements");
            Requirements::check(extra).ensure()?;
            step.stop("Requirements satisfied");
        }

        if let Some(cache_dir) = self.ctx.options.cache_dir.clone() {
            step.start(&format!("Opening cache at {}", cache_dir.display()));
            let mut cache = CacheStore::open(&cache_dir)?;
            if self.ctx.options.show_cache {
                step.stop("Cache open");
                print_cache(&cache);
            }
            let evicted = cache.purge()?;
            for notice in &evicted {
                info!(source = %notice.source, reason = %notice.reason, "evicted");
            }
            if !self.ctx.options.show_cache {
                step.stop(&format!(
                    "Cache ready: {} entries, {} ({} evicted)",
                    cache.len(),
                    format_size(cache.total_size()),
                    evicted.len()
                ));
            }
            self.cache = Some(cache);
        } else if self.ctx.options.show_cache {
            println!("Not using a cache (pass --cache-dir).");
        }

        if self.ctx.options.check {
            let mut no_downloads = NoDownloads;
            let mut orchestrator = Orchestrator::new(
                &recipe,
                self.cache.as_mut(),
                &mut no_downloads,
                &self.ctx.build_dir,
                ui,
            );
            step.start("Checking all sources");
            let total = orchestrator.check_sources().await?;
            step.stop(&format!(
                "All sources reachable, {} to download",
                format_size(total)
            ));
            return Ok(());
        }

        step.start("Starting download engine");
        self.engine = Some(EngineClient::start().await?);
        step.stop("Download engine ready");
        let Some(engine) = self.engine.as_mut() else {
            return Err(ImagerError::EngineUnavailable { attempts: 0 });
        };

        let mut orchestrator = Orchestrator::new(
            &recipe,
            self.cache.as_mut(),
            engine,
            &self.ctx.build_dir,
            ui,
        );

        step.start("Checking all sources");
        orchestrator.check_sources().await?;
        step.stop("All sources reachable");

        self.output_created = true;

        step.start("Fetching base image");
        let base_size = orchestrator.fetch_base(&output).await?;
        step.stop(&format!("Base image ready ({})", format_size(base_size)));

        let image_size = match recipe.output.size {
            OutputSize::Auto => round_up(base_size, SIZE_ALIGNMENT),
            OutputSize::Bytes(size) if size < base_size => {
                return Err(ImagerError::RecipeInvalid(format!(
                    "output.size {} is smaller than the base image ({})",
                    format_size(size),
                    format_size(base_size)
                )))
            }
            OutputSize::Bytes(size) => size,
        };
        guard_max_size(self.ctx.options.max_size, image_size)?;
        debug!(image_size, "output size decided");

        let mount_root = self.ctx.build_dir.join("mounts");
        self.layout = Some(ImageLayout::new(&output, &mount_root, self.ctx.runner));
        let Some(layout) = self.layout.as_mut() else {
            return Err(ImagerError::NoLoopDevice);
        };

        step.start(&format!("Resizing image to {}", format_size(image_size)));
        layout.grow_file(image_size)?;
        let loop_dev = layout.attach().await?;
        step.stop(&format!("Image attached to {loop_dev}"));

        step.start("Extending data partition");
        layout.probe()?;
        layout.extend_data_partition().await?;
        layout.resize_data_filesystem().await?;
        let capacity =
            layout.probe()?.data_partition()?.length_sectors * crate::layout::partitions::SECTOR_SIZE;
        step.stop(&format!(
            "Data partition extended ({})",
            format_size(capacity)
        ));

        let declared = recipe.declared_content_size();
        if declared > capacity {
            return Err(ImagerError::RecipeInvalid(format!(
                "declared content ({}) exceeds data partition capacity ({})",
                format_size(declared),
                format_size(capacity)
            )));
        }

        let data_root = layout.mount_data().await?;
        step.start("Placing OCI images");
        orchestrator
            .fetch_oci_images(&data_root, &self.ctx.runner)
            .await?;
        step.stop("OCI images placed");

        step.start("Writing local content");
        orchestrator.place_content_files(&data_root)?;
        step.stop("Local content written");

        step.start("Downloading content");
        orchestrator.fetch_remote_files(&data_root).await?;
        step.stop("Content downloaded");

        layout.unmount_data().await?;
        // OK to fail (will be caught on first boot)
        if let Err(e) = layout.check_data_filesystem().await {
            warn!("post-population filesystem check failed: {e}");
        }

        let boot_root = layout.mount_boot().await?;
        step.start("Writing boot configuration");
        write_boot_config(&recipe, &boot_root)?;
        layout.unmount_boot().await?;
        step.stop("Boot configuration written");

        if recipe.output.shrink {
            step.start("Shrinking image");
            let final_size = layout.shrink_data_partition().await?;
            layout.detach().await?;
            layout.truncate_file(final_size)?;
            step.stop(&format!("Image shrunk to {}", format_size(final_size)));
        } else {
            layout.detach().await?;
        }

        self.succeeded = true;
        step.stop(&format!(
            "Image created successfully: {}",
            output.display()
        ));
        Ok(())
    }

    /// Release everything in reverse order of acquisition. Safe to call
    /// after a cancelled or failed `drive`.
    pub async fn finish(&mut self, result: ImagerResult<()>) -> ImagerResult<()> {
        if let Some(engine) = self.engine.as_mut() {
            let _ = engine.shutdown().await;
        }
        self.engine = None;

        if let Some(layout) = self.layout.as_mut() {
            layout.release().await;
        }
        self.layout = None;

        // journal records are fsynced per append; dropping closes the lock
        self.cache = None;

        // temp build dirs vanish with their guard; user-supplied ones
        // only lose what the build created
        if self.ctx.options.build_dir.is_some() && !self.ctx.options.keep {
            for sub in ["artifacts", "mounts", "oci_export"] {
                let _ = std::fs::remove_dir_all(self.ctx.build_dir.join(sub));
            }
        }

        if !self.succeeded && self.output_created && !self.ctx.options.keep {
            debug!("removing failed output");
            let _ = std::fs::remove_file(&self.ctx.options.output);
        }
        result
    }

    async fn load_recipe(&self) -> ImagerResult<Recipe> {
        let src = &self.ctx.options.config_src;
        let text = if src.starts_with("http://") || src.starts_with("https://") {
            let response =
                reqwest::get(src)
                    .await
                    .map_err(|e| ImagerError::UrlUnreachable {
                        url: src.clone(),
                        reason: e.to_string(),
                    })?;
            if !response.status().is_success() {
                return Err(ImagerError::RecipeNotFound(src.clone()));
            }
            response.text().await?
        } else {
            let path = Path::new(src);
            if !path.is_file() {
                return Err(ImagerError::RecipeNotFound(src.clone()));
            }
            std::fs::read_to_string(path)
                .map_err(|e| ImagerError::io(format!("reading {src}"), e))?
        };
        Recipe::from_yaml(&text)
    }
}

/// Serialise the opaque config blobs onto the boot partition
fn write_boot_config(recipe: &Recipe, boot_root: &Path) -> ImagerResult<()> {
    if let Some(offspot) = &recipe.offspot {
        let path = boot_root.join("offspot.yaml");
        std::fs::write(&path, serde_yaml::to_string(offspot)?)
            .map_err(|e| ImagerError::io(format!("writing {}", path.display()), e))?;
        info!("offspot.yaml written");
    }
    if let Some(serde_yaml::Value::Mapping(blobs)) = &recipe.write_config {
        for (name, content) in blobs {
            let Some(name) = name.as_str() else {
                return Err(ImagerError::RecipeInvalid(
                    "write_config keys must be file names".to_string(),
                ));
            };
            let path = boot_root.join(name);
            let rendered = match content {
                serde_yaml::Value::String(text) => text.clone(),
                other => serde_yaml::to_string(other)?,
            };
            std::fs::write(&path, rendered)
                .map_err(|e| ImagerError::io(format!("writing {}", path.display()), e))?;
            info!(name, "config blob written");
        }
    }
    Ok(())
}

/// Print the cache content, flagging entries the policy would evict
fn print_cache(cache: &CacheStore) {
    if cache.is_empty() {
        println!("Cache is empty.");
        return;
    }
    let doomed: std::collections::HashSet<String> = cache
        .purge_plan()
        .into_iter()
        .map(|(entry, _)| entry.key)
        .collect();

    println!(
        "{} entries, {} total",
        cache.len(),
        format_size(cache.total_size())
    );
    println!(
        "{:>10}  {:>19}  {:>8}  {:>19}  SOURCE",
        "SIZE", "ADDED", "NB USED", "LAST USED"
    );
    for entry in cache.entries() {
        let line = format!(
            "{:>10}  {:>19}  {:>8}  {:>19}  {}",
            format_size(entry.size_bytes),
            entry.added_on.format("%Y-%m-%d %H:%M:%S"),
            entry.nb_used,
            entry.last_used_on.format("%Y-%m-%d %H:%M:%S"),
            entry.source,
        );
        if doomed.contains(&entry.key) {
            println!("{}", console::style(line).red());
        } else {
            println!("{line}");
        }
    }
}

fn round_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

fn guard_max_size(limit: Option<u64>, size: u64) -> ImagerResult<()> {
    if let Some(limit) = limit {
        if size > limit {
            return Err(ImagerError::OutputTooLarge {
                requested: format_size(size),
                limit: format_size(limit),
            });
        }
    }
    Ok(())
}

/// Stand-in downloader for `--check` runs, which never download
struct NoDownloads;

#[async_trait]
impl Downloader for NoDownloads {
    async fn submit(&mut self, request: DownloadRequest) -> ImagerResult<ItemId> {
        Err(ImagerError::DownloadFailed {
            source_url: request.uri,
            reason: "downloads are disabled in check mode".to_string(),
        })
    }

    async fn status(&mut self, _id: ItemId) -> ImagerResult<DownloadStatus> {
        Err(ImagerError::DownloadFailed {
            source_url: String::new(),
            reason: "downloads are disabled in check mode".to_string(),
        })
    }

    async fn shutdown(&mut self) -> ImagerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn round_up_aligns() {
        assert_eq!(round_up(1, SIZE_ALIGNMENT), SIZE_ALIGNMENT);
        assert_eq!(round_up(SIZE_ALIGNMENT, SIZE_ALIGNMENT), SIZE_ALIGNMENT);
        assert_eq!(
            round_up(SIZE_ALIGNMENT + 1, SIZE_ALIGNMENT),
            2 * SIZE_ALIGNMENT
        );
    }

    #[test]
    fn options_from_cli_parse_max_size() {
        let cli = Cli::parse_from([
            "hotspot-imager",
            "--max-size",
            "512GB",
            "recipe.yaml",
            "out.img",
        ]);
        let options = BuildOptions::from_cli(cli).unwrap();
        assert_eq!(options.max_size, Some(512_000_000_000));
    }

    #[test]
    fn options_reject_bad_max_size() {
        let cli = Cli::parse_from(["hotspot-imager", "--max-size", "lots", "r.yaml", "o.img"]);
        assert!(BuildOptions::from_cli(cli).is_err());
    }

    #[test]
    fn guard_max_size_enforced() {
        assert!(guard_max_size(None, u64::MAX).is_ok());
        assert!(guard_max_size(Some(1024), 1024).is_ok());
        assert!(matches!(
            guard_max_size(Some(1024), 2048),
            Err(ImagerError::OutputTooLarge { .. })
        ));
    }

    #[test]
    fn write_boot_config_renders_blobs() {
        let recipe = Recipe::from_yaml(
            r#"
base: {source: "1.2.0"}
offspot:
  hostname: my-hotspot
write_config:
  network.yaml:
    dhcp: true
  motd: "welcome\n"
"#,
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        write_boot_config(&recipe, dir.path()).unwrap();

        let offspot = std::fs::read_to_string(dir.path().join("offspot.yaml")).unwrap();
        assert!(offspot.contains("hostname: my-hotspot"));
        let network = std::fs::read_to_string(dir.path().join("network.yaml")).unwrap();
        assert!(network.contains("dhcp: true"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("motd")).unwrap(),
            "welcome\n"
        );
    }
}
