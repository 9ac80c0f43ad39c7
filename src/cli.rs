//! CLI argument definitions using clap derive

use clap::Parser;
use std::path::PathBuf;

/// hotspot-imager - build a bootable hotspot disk image
///
/// Downloads a base image, grows its data partition, and fills it with
/// the content described in a YAML recipe, going through a persistent
/// download cache.
#[derive(Parser, Debug)]
#[command(name = "hotspot-imager")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Recipe YAML file path or URL
    #[arg(value_name = "CONFIG_SRC")]
    pub config_src: String,

    /// Where to write the image to
    #[arg(value_name = "OUTPUT")]
    pub output: PathBuf,

    /// Directory to store temporary files in (defaults to a fresh
    /// directory under $TMPDIR)
    #[arg(long, value_name = "DIR")]
    pub build_dir: Option<PathBuf>,

    /// Directory to use as a download cache. Policy is read from
    /// CACHE_DIR/policy.yaml on every build.
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Print a summary of the cache content, flagging entries the
    /// current policy would evict
    #[arg(long)]
    pub show_cache: bool,

    /// Only check inputs, URLs and sizes. Don't download or create the image.
    #[arg(short = 'C', long)]
    pub check: bool,

    /// Don't remove the output image if creation failed
    #[arg(short = 'K', long)]
    pub keep: bool,

    /// Don't fail on an existing output image: remove it instead
    #[arg(short = 'X', long)]
    pub overwrite: bool,

    /// Maximum image size allowed (e.g. 512GB)
    #[arg(long, value_name = "SIZE")]
    pub max_size: Option<String>,

    /// Mirror subprocess output and enable debug logging
    #[arg(short = 'D', long)]
    pub debug: bool,
}
