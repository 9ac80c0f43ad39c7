//! Typed recipe parsed from the input YAML
//!
//! The recipe describes the base image, the output geometry, the OCI
//! images and the files to place on the data partition. Unknown keys are
//! ignored; `offspot` and `write_config` are carried as opaque blobs for
//! the boot-config writer.

use crate::error::{ImagerError, ImagerResult};
use crate::units::parse_size;
use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

/// Mount path of the data partition on the running device. All file
/// destinations must live under it.
pub const DATA_PART_PATH: &str = "/data";

/// Content payloads starting with this tag are base64-encoded
pub const BASE64_TAG: &str = "base64:";

const BASE_URL_TEMPLATE: &str = "https://drive.offspot.it/base/base-image-{version}.img.xz";

/// Parsed recipe
#[derive(Debug, Clone, Deserialize)]
pub struct Recipe {
    /// Base image to start from
    pub base: BaseSpec,

    /// Output image geometry
    #[serde(default)]
    pub output: OutputSpec,

    /// OCI images to place in the image
    #[serde(default)]
    pub oci_images: Vec<OciImageSpec>,

    /// Files to write onto the data partition
    #[serde(default)]
    pub files: Vec<FileSpec>,

    /// Opaque runtime configuration written to the boot partition
    #[serde(default)]
    pub offspot: Option<serde_yaml::Value>,

    /// Opaque extra config blobs forwarded to the boot-config writer
    #[serde(default)]
    pub write_config: Option<serde_yaml::Value>,
}

/// `base` entry: a version string or a full URL
#[derive(Debug, Clone, Deserialize)]
pub struct BaseSpec {
    pub source: String,

    /// Size of the root (second) partition content, used for size checks
    #[serde(default, deserialize_with = "de_opt_size")]
    pub root_size: Option<u64>,
}

impl BaseSpec {
    /// Download URL for the base image. Version strings map to the
    /// published base-image archive; anything else must already be a URL.
    pub fn url(&self) -> ImagerResult<String> {
        let is_version = Regex::new(r"^\d\.\d\.\d[a-z0-9.\-_]*$")
            .map(|re| re.is_match(&self.source))
            .unwrap_or(false);
        if is_version {
            return Ok(BASE_URL_TEMPLATE.replace("{version}", &self.source));
        }
        if self.source.starts_with("http://") || self.source.starts_with("https://") {
            return Ok(self.source.clone());
        }
        Err(ImagerError::RecipeInvalid(format!(
            "base.source `{}` is neither a version nor a URL",
            self.source
        )))
    }
}

/// `output` entry
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutputSpec {
    /// Target image size; `auto` derives it from the base image
    pub size: OutputSize,

    /// Shrink the data partition and the image file once populated
    pub shrink: bool,
}

/// Requested output size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputSize {
    /// Derive from the decompressed base image size
    #[default]
    Auto,
    /// Explicit byte count
    Bytes(u64),
}

impl<'de> Deserialize<'de> for OutputSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(bytes) => Ok(OutputSize::Bytes(bytes)),
            Raw::Text(text) if text == "auto" => Ok(OutputSize::Auto),
            Raw::Text(text) => parse_size(&text)
                .map(OutputSize::Bytes)
                .map_err(|e| D::Error::custom(e.to_string())),
        }
    }
}

/// One OCI image entry
#[derive(Debug, Clone, Deserialize)]
pub struct OciImageSpec {
    /// Full image reference including tag or digest
    pub ident: String,

    /// Optional URL of a pre-exported tarball; absent means the export
    /// tool produces it
    #[serde(default)]
    pub url: Option<String>,

    /// Size of the exported tarball
    #[serde(deserialize_with = "de_size")]
    pub filesize: u64,

    /// Size once loaded into the container store
    #[serde(deserialize_with = "de_size")]
    pub fullsize: u64,
}

/// How a downloaded file is turned into on-image content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Via {
    #[default]
    Direct,
    Tar,
    Gztar,
    Bztar,
    Xztar,
    Zip,
}

impl Via {
    pub fn is_archive(&self) -> bool {
        !matches!(self, Via::Direct)
    }
}

/// Declared checksum, written `algo:hex` in the recipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algo: String,
    pub hex: String,
}

impl serde::Serialize for Checksum {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}:{}", self.algo, self.hex))
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let (algo, hex) = text
            .split_once(':')
            .ok_or_else(|| D::Error::custom(format!("checksum `{text}` is not algo:hex")))?;
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(D::Error::custom(format!("checksum `{text}` has invalid hex")));
        }
        Ok(Checksum {
            algo: algo.to_ascii_lowercase(),
            hex: hex.to_ascii_lowercase(),
        })
    }
}

/// One file entry
#[derive(Debug, Clone, Deserialize)]
pub struct FileSpec {
    /// Destination path, under `/data`
    pub to: PathBuf,

    #[serde(default)]
    pub url: Option<String>,

    /// Inline content, plain text or `base64:`-tagged
    #[serde(default)]
    pub content: Option<String>,

    #[serde(default)]
    pub via: Via,

    /// Declared size of the (expanded) content
    #[serde(default, deserialize_with = "de_opt_size")]
    pub size: Option<u64>,

    #[serde(default)]
    pub checksum: Option<Checksum>,
}

impl FileSpec {
    /// Destination path inside a mounted data partition
    pub fn mounted_to(&self, mount_point: &Path) -> ImagerResult<PathBuf> {
        let relative = self
            .to
            .strip_prefix(DATA_PART_PATH)
            .map_err(|_| ImagerError::RecipeInvalid(format!("{} is outside /data", self.to.display())))?;
        Ok(mount_point.join(relative))
    }

    /// Decoded inline content, or None for url entries
    pub fn decoded_content(&self) -> ImagerResult<Option<Vec<u8>>> {
        match &self.content {
            None => Ok(None),
            Some(text) => match text.strip_prefix(BASE64_TAG) {
                Some(encoded) => decode_base64(encoded).map(Some),
                None => Ok(Some(text.as_bytes().to_vec())),
            },
        }
    }
}

impl Recipe {
    /// Parse and validate a recipe from YAML text
    pub fn from_yaml(text: &str) -> ImagerResult<Self> {
        let recipe: Recipe = serde_yaml::from_str(text)?;
        recipe.validate()?;
        Ok(recipe)
    }

    fn validate(&self) -> ImagerResult<()> {
        if self.base.source.trim().is_empty() {
            return Err(ImagerError::RecipeInvalid("base.source is empty".to_string()));
        }
        self.base.url()?;

        let mut destinations = HashSet::new();
        for file in &self.files {
            match (&file.url, &file.content) {
                (Some(_), Some(_)) => {
                    return Err(ImagerError::RecipeInvalid(format!(
                        "{}: both url and content set",
                        file.to.display()
                    )))
                }
                (None, None) => {
                    return Err(ImagerError::RecipeInvalid(format!(
                        "{}: neither url nor content set",
                        file.to.display()
                    )))
                }
                _ => {}
            }

            if !path_is_under_data(&file.to) {
                return Err(ImagerError::RecipeInvalid(format!(
                    "{} is not a descendant of {}",
                    file.to.display(),
                    DATA_PART_PATH
                )));
            }

            if file.content.is_some() && file.via.is_archive() {
                return Err(ImagerError::RecipeInvalid(format!(
                    "{}: inline content cannot use via={:?}",
                    file.to.display(),
                    file.via
                )));
            }

            if !destinations.insert(file.to.clone()) {
                return Err(ImagerError::RecipeInvalid(format!(
                    "several files target {}",
                    file.to.display()
                )));
            }
        }

        for image in &self.oci_images {
            if image.ident.trim().is_empty() {
                return Err(ImagerError::RecipeInvalid("oci_images entry with empty ident".to_string()));
            }
        }
        Ok(())
    }

    /// Files carrying inline content (no network item)
    pub fn content_files(&self) -> impl Iterator<Item = &FileSpec> {
        self.files.iter().filter(|f| f.content.is_some())
    }

    /// Files fetched from a URL
    pub fn remote_files(&self) -> impl Iterator<Item = &FileSpec> {
        self.files.iter().filter(|f| f.url.is_some())
    }

    /// Sum of declared content sizes (expanded where relevant), used for
    /// capacity checks against the data partition
    pub fn declared_content_size(&self) -> u64 {
        let files: u64 = self
            .files
            .iter()
            .map(|f| {
                f.size.unwrap_or_else(|| {
                    f.content
                        .as_ref()
                        .map(|c| c.len() as u64)
                        .unwrap_or(0)
                })
            })
            .sum();
        let images: u64 = self.oci_images.iter().map(|i| i.fullsize).sum();
        files + images
    }
}

/// Whether `path` is an absolute, traversal-free descendant of `/data`
fn path_is_under_data(path: &Path) -> bool {
    if !path.starts_with(DATA_PART_PATH) || path == Path::new(DATA_PART_PATH) {
        return false;
    }
    path.components()
        .all(|c| !matches!(c, Component::ParentDir | Component::CurDir))
}

fn de_size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(bytes) => Ok(bytes),
        Raw::Text(text) => parse_size(&text).map_err(|e| D::Error::custom(e.to_string())),
    }
}

fn de_opt_size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(bytes)) => Ok(Some(bytes)),
        Some(Raw::Text(text)) => parse_size(&text)
            .map(Some)
            .map_err(|e| D::Error::custom(e.to_string())),
    }
}

const BASE64_ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Decode standard base64 (RFC 4648 with padding)
fn decode_base64(text: &str) -> ImagerResult<Vec<u8>> {
    let mut reverse = [255u8; 256];
    for (value, &symbol) in BASE64_ALPHABET.iter().enumerate() {
        reverse[symbol as usize] = value as u8;
    }

    let cleaned: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if cleaned.len() % 4 != 0 {
        return Err(ImagerError::RecipeInvalid("base64 content has invalid length".to_string()));
    }

    let mut out = Vec::with_capacity(cleaned.len() / 4 * 3);
    for chunk in cleaned.chunks(4) {
        let padding = chunk.iter().filter(|&&b| b == b'=').count();
        if padding > 2 || chunk[..4 - padding].iter().any(|&b| reverse[b as usize] == 255) {
            return Err(ImagerError::RecipeInvalid("base64 content has invalid symbols".to_string()));
        }
        let bits: u32 = chunk
            .iter()
            .map(|&b| if b == b'=' { 0 } else { reverse[b as usize] as u32 })
            .fold(0, |acc, v| (acc << 6) | v);
        out.push((bits >> 16) as u8);
        if padding < 2 {
            out.push((bits >> 8) as u8);
        }
        if padding == 0 {
            out.push(bits as u8);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
base:
  source: "1.2.0"
files:
  - to: /data/conf/hello.txt
    content: "hi\n"
"#;

    #[test]
    fn parses_minimal_recipe() {
        let recipe = Recipe::from_yaml(MINIMAL).unwrap();
        assert_eq!(recipe.files.len(), 1);
        assert_eq!(recipe.output.size, OutputSize::Auto);
        assert!(!recipe.output.shrink);
    }

    #[test]
    fn base_version_maps_to_url() {
        let recipe = Recipe::from_yaml(MINIMAL).unwrap();
        assert_eq!(
            recipe.base.url().unwrap(),
            "https://drive.offspot.it/base/base-image-1.2.0.img.xz"
        );
    }

    #[test]
    fn base_url_passes_through() {
        let base = BaseSpec {
            source: "https://example.org/base.img.xz".to_string(),
            root_size: None,
        };
        assert_eq!(base.url().unwrap(), "https://example.org/base.img.xz");
    }

    #[test]
    fn base_garbage_rejected() {
        let base = BaseSpec {
            source: "not a version".to_string(),
            root_size: None,
        };
        assert!(base.url().is_err());
    }

    #[test]
    fn rejects_url_and_content() {
        let text = r#"
base: {source: "1.2.0"}
files:
  - to: /data/x
    url: https://example.org/x
    content: "both"
"#;
        assert!(Recipe::from_yaml(text).is_err());
    }

    #[test]
    fn rejects_destination_outside_data() {
        for to in ["/etc/passwd", "/data/../etc/passwd", "/data"] {
            let text = format!(
                "base: {{source: \"1.2.0\"}}\nfiles:\n  - to: {to}\n    content: x\n"
            );
            assert!(Recipe::from_yaml(&text).is_err(), "{to} accepted");
        }
    }

    #[test]
    fn rejects_duplicate_destinations() {
        let text = r#"
base: {source: "1.2.0"}
files:
  - {to: /data/x, content: a}
  - {to: /data/x, content: b}
"#;
        assert!(Recipe::from_yaml(text).is_err());
    }

    #[test]
    fn unknown_keys_ignored() {
        let text = r#"
base: {source: "1.2.0"}
something_new: 42
"#;
        assert!(Recipe::from_yaml(text).is_ok());
    }

    #[test]
    fn output_size_variants() {
        let text = r#"
base: {source: "1.2.0"}
output: {size: auto, shrink: true}
"#;
        let recipe = Recipe::from_yaml(text).unwrap();
        assert_eq!(recipe.output.size, OutputSize::Auto);
        assert!(recipe.output.shrink);

        let text = r#"
base: {source: "1.2.0"}
output: {size: 8GiB}
"#;
        let recipe = Recipe::from_yaml(text).unwrap();
        assert_eq!(recipe.output.size, OutputSize::Bytes(8 * 1024 * 1024 * 1024));
    }

    #[test]
    fn checksum_parses() {
        let text = r#"
base: {source: "1.2.0"}
files:
  - to: /data/x
    url: https://example.org/x
    checksum: "sha256:ABCDEF0123"
"#;
        let recipe = Recipe::from_yaml(text).unwrap();
        let checksum = recipe.files[0].checksum.as_ref().unwrap();
        assert_eq!(checksum.algo, "sha256");
        assert_eq!(checksum.hex, "abcdef0123");
    }

    #[test]
    fn checksum_rejects_bad_format() {
        let text = r#"
base: {source: "1.2.0"}
files:
  - to: /data/x
    url: https://example.org/x
    checksum: "nohex"
"#;
        assert!(Recipe::from_yaml(text).is_err());
    }

    #[test]
    fn plain_content_decodes_as_utf8() {
        let recipe = Recipe::from_yaml(MINIMAL).unwrap();
        let bytes = recipe.files[0].decoded_content().unwrap().unwrap();
        assert_eq!(bytes, b"hi\n");
    }

    #[test]
    fn base64_content_decodes() {
        let file = FileSpec {
            to: PathBuf::from("/data/x.bin"),
            url: None,
            content: Some("base64:AAECAw==".to_string()),
            via: Via::Direct,
            size: None,
            checksum: None,
        };
        assert_eq!(file.decoded_content().unwrap().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn base64_rejects_garbage() {
        assert!(decode_base64("!!!!").is_err());
        assert!(decode_base64("AAA").is_err());
        assert_eq!(decode_base64("aGk=").unwrap(), b"hi".to_vec());
    }

    #[test]
    fn mounted_to_strips_data_prefix() {
        let file = FileSpec {
            to: PathBuf::from("/data/conf/hello.txt"),
            url: None,
            content: Some("hi".to_string()),
            via: Via::Direct,
            size: None,
            checksum: None,
        };
        assert_eq!(
            file.mounted_to(Path::new("/mnt/part3")).unwrap(),
            PathBuf::from("/mnt/part3/conf/hello.txt")
        );
    }

    #[test]
    fn declared_content_size_sums() {
        let text = r#"
base: {source: "1.2.0"}
oci_images:
  - {ident: "ghcr.io/offspot/kiwix:1.0", filesize: 100, fullsize: 300}
files:
  - {to: /data/a, content: "abcd"}
  - {to: /data/b, url: "https://example.org/b", size: 50}
"#;
        let recipe = Recipe::from_yaml(text).unwrap();
        assert_eq!(recipe.declared_content_size(), 300 + 4 + 50);
    }
}
