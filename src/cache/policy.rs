//! Cache policy tree and resolution
//!
//! The policy is a three-level tree: global options, per-class options
//! (`oci_images`, `files`) and an ordered list of per-filter options
//! inside each class. `resolve()` flattens the tree into the effective
//! policy for one entry; the first filter whose pattern matches the
//! entry's source wins and later filters are never consulted.

use crate::error::{ImagerError, ImagerResult};
use crate::units::{parse_duration, parse_size};
use regex::RegexBuilder;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::Path;

/// Default global cap when no policy file is present
pub const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Which pool of the cache an entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemClass {
    OciImage,
    File,
}

impl fmt::Display for ItemClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OciImage => write!(f, "oci_image"),
            Self::File => write!(f, "file"),
        }
    }
}

/// Ordering applied to eviction candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Eviction {
    Oldest,
    Newest,
    Largest,
    Smallest,
    #[default]
    Lru,
}

/// Options shared by every level of the tree. `None` means "bounded by
/// the parent"; an explicit `0` for `max_size`/`max_num` disables
/// caching at that scope.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CommonOptions {
    #[serde(deserialize_with = "de_opt_size")]
    pub max_size: Option<u64>,

    #[serde(deserialize_with = "de_opt_duration")]
    pub max_age: Option<u64>,

    pub max_num: Option<u32>,

    pub eviction: Option<Eviction>,

    /// Entries checked upstream within this window are served without
    /// revalidation
    #[serde(deserialize_with = "de_opt_duration")]
    pub check_after: Option<u64>,

    /// Number of versions kept per identified item
    pub keep_identified_versions: Option<u32>,
}

/// Per-filter options: a required pattern plus the common set
#[derive(Debug, Clone, Deserialize)]
pub struct FilterPolicy {
    /// Regular expression matched (case-insensitively, anchored at the
    /// start) against the entry source
    pub pattern: String,

    /// Matching entries are never cached
    #[serde(default)]
    pub ignore: bool,

    #[serde(flatten)]
    pub options: CommonOptions,
}

impl FilterPolicy {
    /// Whether this filter applies to the given source
    pub fn matches(&self, source: &str) -> bool {
        RegexBuilder::new(&format!("^(?:{})", self.pattern))
            .case_insensitive(true)
            .build()
            .map(|re| re.is_match(source))
            .unwrap_or(false)
    }
}

/// Per-class options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassPolicy {
    pub enabled: bool,

    #[serde(flatten)]
    pub options: CommonOptions,

    pub filters: Vec<FilterPolicy>,
}

impl Default for ClassPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            options: CommonOptions::default(),
            filters: Vec::new(),
        }
    }
}

/// The whole policy tree, read from `<cache-dir>/policy.yaml`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub enabled: bool,

    #[serde(flatten)]
    pub options: CommonOptions,

    pub oci_images: ClassPolicy,
    pub files: ClassPolicy,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            enabled: true,
            options: CommonOptions {
                max_size: Some(DEFAULT_MAX_SIZE),
                eviction: Some(Eviction::Lru),
                ..CommonOptions::default()
            },
            oci_images: ClassPolicy::default(),
            files: ClassPolicy::default(),
        }
    }
}

/// Flattened policy for one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectivePolicy {
    pub enabled: bool,
    pub max_size: Option<u64>,
    pub max_age: Option<u64>,
    pub max_num: Option<u32>,
    pub eviction: Eviction,
    pub check_after: Option<u64>,
    pub keep_identified_versions: Option<u32>,
    /// Index of the filter that matched, scoping eviction candidates
    pub matched_filter: Option<usize>,
}

impl EffectivePolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_size: None,
            max_age: None,
            max_num: None,
            eviction: Eviction::default(),
            check_after: None,
            keep_identified_versions: None,
            matched_filter: None,
        }
    }
}

impl Policy {
    /// Parse a policy from YAML text and validate it
    pub fn from_yaml(text: &str) -> ImagerResult<Self> {
        let policy: Policy = serde_yaml::from_str(text)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Read `policy.yaml` from the cache directory; a missing file means
    /// the default policy
    pub fn load(cache_dir: &Path) -> ImagerResult<Self> {
        let path = cache_dir.join("policy.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ImagerError::io(format!("reading {}", path.display()), e))?;
        Self::from_yaml(&text).map_err(|e| ImagerError::PolicyInvalid {
            path,
            reason: e.to_string(),
        })
    }

    /// A policy that caches nothing (no `--cache-dir`)
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    fn class(&self, class: ItemClass) -> &ClassPolicy {
        match class {
            ItemClass::OciImage => &self.oci_images,
            ItemClass::File => &self.files,
        }
    }

    fn validate(&self) -> ImagerResult<()> {
        for (name, class) in [("oci_images", &self.oci_images), ("files", &self.files)] {
            check_bounds(name, &class.options, &self.options)?;
            for (idx, filter) in class.filters.iter().enumerate() {
                RegexBuilder::new(&format!("^(?:{})", filter.pattern))
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        ImagerError::RecipeInvalid(format!(
                            "{name}.filters[{idx}].pattern: {e}"
                        ))
                    })?;
                check_bounds(&format!("{name}.filters[{idx}]"), &filter.options, &class.options)?;
            }
        }
        Ok(())
    }

    /// Effective policy for an entry of `class` coming from `source`.
    /// Filter options override class options override global options;
    /// the scope is disabled as soon as any enclosing level is disabled
    /// or caps a relevant limit at zero.
    pub fn resolve(&self, class: ItemClass, source: &str) -> EffectivePolicy {
        let class_policy = self.class(class);

        let matched = class_policy
            .filters
            .iter()
            .enumerate()
            .find(|(_, f)| f.matches(source));

        let mut levels: Vec<&CommonOptions> = vec![&self.options, &class_policy.options];
        let mut enabled = self.enabled && class_policy.enabled;
        let mut matched_filter = None;
        if let Some((idx, filter)) = matched {
            levels.push(&filter.options);
            enabled = enabled && !filter.ignore;
            matched_filter = Some(idx);
        }

        for options in &levels {
            if options.max_size == Some(0) || options.max_num == Some(0) {
                enabled = false;
            }
        }
        if !enabled {
            return EffectivePolicy {
                matched_filter,
                ..EffectivePolicy::disabled()
            };
        }

        EffectivePolicy {
            enabled: true,
            max_size: tightest(levels.iter().map(|o| o.max_size)),
            max_age: tightest(levels.iter().map(|o| o.max_age)),
            max_num: tightest(levels.iter().map(|o| o.max_num)),
            eviction: levels
                .iter()
                .rev()
                .find_map(|o| o.eviction)
                .unwrap_or_default(),
            check_after: most_specific(levels.iter().map(|o| o.check_after)),
            keep_identified_versions: most_specific(
                levels.iter().map(|o| o.keep_identified_versions),
            ),
            matched_filter,
        }
    }
}

/// Tightest (smallest) specified limit across levels
fn tightest<T: Ord + Copy>(values: impl Iterator<Item = Option<T>>) -> Option<T> {
    values.flatten().min()
}

/// Innermost specified value across levels (outermost first)
fn most_specific<T: Copy>(values: impl Iterator<Item = Option<T>>) -> Option<T> {
    values.flatten().last()
}

/// A child limit may not exceed its parent's
fn check_bounds(
    name: &str,
    child: &CommonOptions,
    parent: &CommonOptions,
) -> ImagerResult<()> {
    if let (Some(child_size), Some(parent_size)) = (child.max_size, parent.max_size) {
        if child_size > parent_size && parent_size > 0 {
            return Err(ImagerError::RecipeInvalid(format!(
                "{name}.max_size ({child_size}) exceeds parent max_size ({parent_size})"
            )));
        }
    }
    if let (Some(child_num), Some(parent_num)) = (child.max_num, parent.max_num) {
        if child_num > parent_num && parent_num > 0 {
            return Err(ImagerError::RecipeInvalid(format!(
                "{name}.max_num ({child_num}) exceeds parent max_num ({parent_num})"
            )));
        }
    }
    Ok(())
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

fn de_opt_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(seconds)) => Ok(Some(seconds)),
        Some(Raw::Text(text)) => parse_duration(&text)
            .map(Some)
            .map_err(|e| D::Error::custom(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_documented_defaults() {
        let policy = Policy::default();
        assert!(policy.enabled);
        assert_eq!(policy.options.max_size, Some(DEFAULT_MAX_SIZE));
        let effective = policy.resolve(ItemClass::File, "https://example.org/a.zim");
        assert!(effective.enabled);
        assert_eq!(effective.eviction, Eviction::Lru);
        assert_eq!(effective.max_size, Some(DEFAULT_MAX_SIZE));
    }

    #[test]
    fn parses_full_tree() {
        let text = r#"
enabled: true
max_size: 20GiB
files:
  max_size: 10GiB
  eviction: oldest
  filters:
    - pattern: 'https://download\.kiwix\.org/'
      max_num: 4
      keep_identified_versions: 1
    - pattern: '.*\.iso$'
      ignore: true
"#;
        let policy = Policy::from_yaml(text).unwrap();
        assert_eq!(policy.files.filters.len(), 2);
        assert_eq!(policy.files.options.max_size, Some(10 * 1024 * 1024 * 1024));
    }

    #[test]
    fn first_matching_filter_wins() {
        // both filters match; only the first one's options must apply
        let text = r#"
files:
  filters:
    - pattern: 'https://download\.'
      max_num: 4
    - pattern: 'https://download\.kiwix\.org/'
      max_num: 1
      ignore: true
"#;
        let policy = Policy::from_yaml(text).unwrap();
        let effective = policy.resolve(ItemClass::File, "https://download.kiwix.org/x.zim");
        assert_eq!(effective.matched_filter, Some(0));
        assert_eq!(effective.max_num, Some(4));
        assert!(effective.enabled, "second filter's ignore leaked through");
    }

    #[test]
    fn filter_match_is_case_insensitive_and_anchored() {
        let filter = FilterPolicy {
            pattern: "https://Download".to_string(),
            ignore: false,
            options: CommonOptions::default(),
        };
        assert!(filter.matches("https://download.kiwix.org/"));
        assert!(!filter.matches("see https://download.kiwix.org/"));
    }

    #[test]
    fn max_size_zero_disables_scope() {
        let text = "files:\n  max_size: 0\n";
        let policy = Policy::from_yaml(text).unwrap();
        assert!(!policy.resolve(ItemClass::File, "https://x/y").enabled);
        // other class untouched
        assert!(policy.resolve(ItemClass::OciImage, "ghcr.io/x:1").enabled);
    }

    #[test]
    fn global_disabled_wins_over_class() {
        let text = "enabled: false\nfiles:\n  enabled: true\n";
        let policy = Policy::from_yaml(text).unwrap();
        assert!(!policy.resolve(ItemClass::File, "https://x/y").enabled);
    }

    #[test]
    fn ignore_filter_disables_entry() {
        let text = r#"
files:
  filters:
    - pattern: '.*\.iso$'
      ignore: true
"#;
        let policy = Policy::from_yaml(text).unwrap();
        assert!(!policy.resolve(ItemClass::File, "x.iso").enabled);
        assert!(policy.resolve(ItemClass::File, "x.zim").enabled);
    }

    #[test]
    fn tightest_limit_applies() {
        let text = r#"
max_size: 20GiB
max_num: 100
files:
  max_size: 5GiB
  filters:
    - pattern: '.*'
      max_num: 3
"#;
        let policy = Policy::from_yaml(text).unwrap();
        let effective = policy.resolve(ItemClass::File, "https://x/y");
        assert_eq!(effective.max_size, Some(5 * 1024 * 1024 * 1024));
        assert_eq!(effective.max_num, Some(3));
    }

    #[test]
    fn eviction_uses_most_specific_level() {
        let text = r#"
eviction: oldest
files:
  eviction: largest
  filters:
    - pattern: 'https://a/'
      eviction: newest
"#;
        let policy = Policy::from_yaml(text).unwrap();
        assert_eq!(
            policy.resolve(ItemClass::File, "https://a/x").eviction,
            Eviction::Newest
        );
        assert_eq!(
            policy.resolve(ItemClass::File, "https://b/x").eviction,
            Eviction::Largest
        );
        assert_eq!(
            policy.resolve(ItemClass::OciImage, "ghcr.io/x:1").eviction,
            Eviction::Oldest
        );
    }

    #[test]
    fn check_after_falls_through() {
        let text = "check_after: 3d\nfiles: {}\n";
        let policy = Policy::from_yaml(text).unwrap();
        assert_eq!(
            policy.resolve(ItemClass::File, "https://x/y").check_after,
            Some(3 * 86400)
        );
    }

    #[test]
    fn child_exceeding_parent_rejected() {
        let text = "max_size: 1GiB\nfiles:\n  max_size: 2GiB\n";
        assert!(Policy::from_yaml(text).is_err());
    }

    #[test]
    fn invalid_filter_pattern_rejected() {
        let text = "files:\n  filters:\n    - pattern: '(['\n";
        assert!(Policy::from_yaml(text).is_err());
    }

    #[test]
    fn missing_policy_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let policy = Policy::load(dir.path()).unwrap();
        assert_eq!(policy.options.max_size, Some(DEFAULT_MAX_SIZE));
    }
}
