use anyhow::{Context, Result};
use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Exit status the CLI uses for fatal benchmark-authoring errors, so that
/// submit tooling can tell a broken definition apart from an I/O failure.
pub const SETUP_FAILURE_EXIT: i32 = 2;

/// Fatal errors caused by the benchmark definition itself. These abort the
/// whole generation run; everything else is propagated as plain `anyhow`
/// context.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("directory {} already exists (set \"overwrite\": true to regenerate)", .0.display())]
    DirectoryExists(PathBuf),

    #[error(
        "config '{config_file}:L{config_line}' references ${index}, but instance \
         '{instance_file}:L{instance_line}' provides only {provided} field(s); \
         content was '{content}'"
    )]
    MissingInstanceField {
        config_file: String,
        config_line: usize,
        instance_file: String,
        instance_line: usize,
        index: usize,
        provided: usize,
        content: String,
    },

    #[error(
        "instance file '{name}' is staged from both {} and {}; same-named \
         instances from different paths are not supported",
        .first.display(),
        .second.display()
    )]
    AmbiguousDuplicate {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory {}", path.display()))
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Marks a generated script executable for owner/group/other.
#[cfg(unix)]
pub fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o111);
    fs::set_permissions(path, perms)
        .with_context(|| format!("failed to chmod {}", path.display()))
}

#[cfg(not(unix))]
pub fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Expands a leading `~` against the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

/// Rewrites a path below the home directory to `~/...` form. Generated
/// scripts run on compute nodes where the absolute home prefix can differ
/// from the login node, but `~` resolves on both.
pub fn home_relative(path: &Path) -> String {
    if let Some(home) = dirs::home_dir() {
        if let Ok(rel) = path.strip_prefix(&home) {
            return format!("~/{}", rel.display());
        }
    }
    path.display().to_string()
}

/// An instance or config source: one list file, several list files, or an
/// explicit name -> list-file mapping. The JSON shape decides the variant.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SourceSpec {
    Single(PathBuf),
    List(Vec<PathBuf>),
    Named(IndexMap<String, PathBuf>),
}

/// One benchmark tree to generate: its directory label and the list file
/// feeding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub label: String,
    pub list_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ResolvedSources {
    pub entries: Vec<SourceEntry>,
    /// Extra directory level above the benchmark trees; empty for a single
    /// source, `<name>/` for list and named sources.
    pub dir_prefix: String,
}

fn source_disabled(s: &str) -> bool {
    s.is_empty() || s.starts_with('#') || s.starts_with('%')
}

impl SourceSpec {
    pub fn resolve(&self, bench_name: &str) -> ResolvedSources {
        match self {
            SourceSpec::Single(path) => ResolvedSources {
                entries: vec![SourceEntry {
                    label: bench_name.to_string(),
                    list_file: path.clone(),
                }],
                dir_prefix: String::new(),
            },
            SourceSpec::List(paths) => {
                let entries = paths
                    .iter()
                    .map(|p| {
                        let stem = p
                            .file_stem()
                            .map(|s| s.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        SourceEntry {
                            label: format!("{}_{}", bench_name, stem),
                            list_file: p.clone(),
                        }
                    })
                    .collect();
                ResolvedSources {
                    entries,
                    dir_prefix: format!("{}/", bench_name),
                }
            }
            SourceSpec::Named(map) => {
                let mut entries = Vec::new();
                for (label, path) in map {
                    let value = path.to_string_lossy();
                    if source_disabled(label) || source_disabled(&value) {
                        warn!(label = %label, path = %value, "skipping disabled source entry");
                        continue;
                    }
                    entries.push(SourceEntry {
                        label: label.clone(),
                        list_file: path.clone(),
                    });
                }
                ResolvedSources {
                    entries,
                    dir_prefix: format!("{}/", bench_name),
                }
            }
        }
    }
}

/// One surviving line of a list file, with its synthetic ID and the file
/// and 1-based line it came from (for error reporting).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub id: String,
    pub label: String,
    pub file: PathBuf,
    pub line: usize,
}

/// Ordered `<kind><n>` -> label table built from list files. Comment and
/// blank lines are dropped and do not advance the index, so IDs are dense
/// over the surviving lines.
#[derive(Debug, Clone, Default)]
pub struct NamedSet {
    entries: Vec<ListEntry>,
}

impl NamedSet {
    pub fn from_list_file(kind: &str, path: &Path) -> Result<Self> {
        let mut set = NamedSet::default();
        set.append_list_file(kind, path)?;
        Ok(set)
    }

    /// Appends a further list file, continuing the ID sequence. Used when a
    /// config source names several files that form one config set.
    pub fn append_list_file(&mut self, kind: &str, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read list file {}", path.display()))?;
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let id = format!("{}{}", kind, self.entries.len() + 1);
            self.entries.push(ListEntry {
                id,
                label: line.to_string(),
                file: path.to_path_buf(),
                line: lineno + 1,
            });
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ListEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_map(&self) -> LabelMap {
        self.entries
            .iter()
            .map(|e| (e.id.clone(), e.label.clone()))
            .collect()
    }
}

/// Ordered synthetic-ID -> label table as persisted in `metadata.json`.
pub type LabelMap = IndexMap<String, String>;

/// Side-table persisted as `metadata.json` next to each generated tree;
/// the only mapping from synthetic directory IDs back to human labels.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metadata {
    pub instances: LabelMap,
    pub configs: LabelMap,
}

impl Metadata {
    pub fn new(instances: &NamedSet, configs: &NamedSet) -> Self {
        Metadata {
            instances: instances.to_map(),
            configs: configs.to_map(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read metadata file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("malformed metadata file {}", path.display()))
    }

    pub fn store(&self, path: &Path) -> Result<()> {
        atomic_write_json_pretty(path, self)
    }
}

fn default_runs() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_kill_delay() -> u64 {
    5
}

fn default_time_buffer() -> u64 {
    10
}

fn default_timeout_factor() -> u64 {
    1
}

fn default_partition() -> String {
    "broadwell".to_string()
}

fn default_cpus_per_node() -> u32 {
    24
}

fn default_mem_lines() -> u32 {
    4
}

fn default_cpu_freq() -> u64 {
    2200
}

fn default_runsolver_path() -> PathBuf {
    PathBuf::from("/opt/runsolver")
}

/// The consumed benchmark definition. Timeout and kill delay are seconds,
/// memory is MB, cpu_freq is MHz.
#[derive(Debug, Clone, Deserialize)]
pub struct BenchConfig {
    pub name: String,
    pub instances: SourceSpec,
    pub configs: SourceSpec,
    pub timeout: u64,
    pub request_cpus: u32,
    pub mem_limit: u64,
    #[serde(default = "default_runs")]
    pub runs: u32,
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub symlink_working_dir: bool,
    #[serde(default = "default_kill_delay")]
    pub runsolver_kill_delay: u64,
    #[serde(default = "default_time_buffer")]
    pub slurm_time_buffer: u64,
    #[serde(default = "default_timeout_factor")]
    pub timeout_factor: u64,
    #[serde(default)]
    pub initial_seed: Option<u64>,
    #[serde(default = "default_partition")]
    pub partition: String,
    #[serde(default = "default_cpus_per_node")]
    pub cpus_per_node: u32,
    #[serde(default = "default_mem_lines")]
    pub mem_lines: u32,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default = "default_true")]
    pub cache_pinning: bool,
    #[serde(default = "default_cpu_freq")]
    pub cpu_freq: u64,
    #[serde(default = "default_true")]
    pub use_perf: bool,
    #[serde(default = "default_runsolver_path")]
    pub runsolver_path: PathBuf,
    #[serde(default)]
    pub billing: Option<String>,
    #[serde(default)]
    pub max_parallel_jobs: Option<u32>,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub email: Option<String>,
    // `scheuler` alias: the field was misspelled in older definitions.
    #[serde(default = "default_true", alias = "write_scheuler_logs")]
    pub write_scheduler_logs: bool,
}

impl BenchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read benchmark definition {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("malformed benchmark definition {}", path.display()))
    }

    /// Resolves the declared working directory to an absolute path:
    /// `~`-prefixed and absolute paths are expanded as-is, anything else is
    /// taken relative to the definition file's directory.
    pub fn resolved_working_dir(&self, definition_dir: &Path) -> Option<PathBuf> {
        self.working_dir.as_ref().map(|wd| {
            let expanded = expand_tilde(wd);
            if expanded.is_absolute() {
                expanded
            } else {
                definition_dir.join(expanded)
            }
        })
    }

    pub fn effective_timeout(&self) -> u64 {
        self.timeout * self.timeout_factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "ferrobench_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("temp dir");
        dir
    }

    #[test]
    fn list_file_skips_comments_without_advancing_ids() {
        let dir = temp_dir("namedset");
        let list = dir.join("instances.txt");
        fs::write(&list, "# header\n\nfoo.cnf\n  \nbar.cnf\n# tail\nbaz.cnf\n").expect("write");

        let set = NamedSet::from_list_file("instance", &list).expect("parse");
        let ids: Vec<_> = set.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["instance1", "instance2", "instance3"]);
        let labels: Vec<_> = set.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["foo.cnf", "bar.cnf", "baz.cnf"]);
        // source lines survive for error reporting
        let lines: Vec<_> = set.iter().map(|e| e.line).collect();
        assert_eq!(lines, vec![3, 5, 7]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn appended_list_files_continue_the_id_sequence() {
        let dir = temp_dir("append");
        let a = dir.join("a.txt");
        let b = dir.join("b.txt");
        fs::write(&a, "first\nsecond\n").expect("write");
        fs::write(&b, "# comment\nthird\n").expect("write");

        let mut set = NamedSet::from_list_file("config", &a).expect("parse a");
        set.append_list_file("config", &b).expect("parse b");
        let ids: Vec<_> = set.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["config1", "config2", "config3"]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn single_source_keeps_bench_name_and_no_prefix() {
        let spec = SourceSpec::Single(PathBuf::from("instances.txt"));
        let resolved = spec.resolve("sat2026");
        assert_eq!(resolved.dir_prefix, "");
        assert_eq!(resolved.entries.len(), 1);
        assert_eq!(resolved.entries[0].label, "sat2026");
    }

    #[test]
    fn list_source_labels_combine_name_and_stem() {
        let spec = SourceSpec::List(vec![
            PathBuf::from("lists/easy.txt"),
            PathBuf::from("hard.list"),
        ]);
        let resolved = spec.resolve("sat2026");
        assert_eq!(resolved.dir_prefix, "sat2026/");
        let labels: Vec<_> = resolved.entries.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["sat2026_easy", "sat2026_hard"]);
    }

    #[test]
    fn named_source_preserves_order_and_skips_disabled_keys() {
        let mut map = IndexMap::new();
        map.insert("zeta".to_string(), PathBuf::from("z.txt"));
        map.insert("#disabled".to_string(), PathBuf::from("d.txt"));
        map.insert("".to_string(), PathBuf::from("e.txt"));
        map.insert("alpha".to_string(), PathBuf::from("%off.txt"));
        map.insert("beta".to_string(), PathBuf::from("b.txt"));
        let resolved = SourceSpec::Named(map).resolve("bench");
        let labels: Vec<_> = resolved.entries.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["zeta", "beta"]);
        assert_eq!(resolved.dir_prefix, "bench/");
    }

    #[test]
    fn bench_config_fills_defaults() {
        let json = r#"{
            "name": "demo",
            "instances": "instances.txt",
            "configs": "configs.txt",
            "timeout": 10,
            "request_cpus": 2,
            "mem_limit": 8000
        }"#;
        let config: BenchConfig = serde_json::from_str(json).expect("parse");
        assert_eq!(config.runs, 1);
        assert_eq!(config.runsolver_kill_delay, 5);
        assert_eq!(config.slurm_time_buffer, 10);
        assert_eq!(config.timeout_factor, 1);
        assert_eq!(config.partition, "broadwell");
        assert_eq!(config.cpus_per_node, 24);
        assert_eq!(config.mem_lines, 4);
        assert!(config.cache_pinning);
        assert!(config.use_perf);
        assert!(!config.overwrite);
        assert!(config.write_scheduler_logs);
        assert!(matches!(config.instances, SourceSpec::Single(_)));
    }

    #[test]
    fn bench_config_accepts_shape_variants_and_legacy_alias() {
        let json = r#"{
            "name": "demo",
            "instances": ["a.txt", "b.txt"],
            "configs": {"base": "configs.txt"},
            "timeout": 10,
            "request_cpus": 2,
            "mem_limit": 8000,
            "write_scheuler_logs": false
        }"#;
        let config: BenchConfig = serde_json::from_str(json).expect("parse");
        assert!(matches!(config.instances, SourceSpec::List(_)));
        assert!(matches!(config.configs, SourceSpec::Named(_)));
        assert!(!config.write_scheduler_logs);
    }

    #[test]
    fn working_dir_resolution() {
        let config: BenchConfig = serde_json::from_str(
            r#"{
                "name": "demo",
                "instances": "i.txt",
                "configs": "c.txt",
                "timeout": 10,
                "request_cpus": 2,
                "mem_limit": 8000,
                "working_dir": "data"
            }"#,
        )
        .expect("parse");
        let resolved = config
            .resolved_working_dir(Path::new("/srv/bench"))
            .expect("working dir");
        assert_eq!(resolved, PathBuf::from("/srv/bench/data"));
    }

    #[test]
    fn home_relative_rewrites_below_home() {
        if let Some(home) = dirs::home_dir() {
            let inside = home.join("bench/run1");
            assert_eq!(home_relative(&inside), "~/bench/run1");
        }
        assert_eq!(home_relative(Path::new("/dev/shm/x")), "/dev/shm/x");
    }

    #[test]
    fn metadata_round_trip() {
        let dir = temp_dir("metadata");
        let list = dir.join("l.txt");
        fs::write(&list, "solverA -x\n").expect("write");
        let configs = NamedSet::from_list_file("config", &list).expect("configs");
        fs::write(&list, "foo.cnf\n").expect("write");
        let instances = NamedSet::from_list_file("instance", &list).expect("instances");

        let path = dir.join("metadata.json");
        Metadata::new(&instances, &configs).store(&path).expect("store");
        let loaded = Metadata::load(&path).expect("load");
        assert_eq!(loaded.configs.get("config1").map(String::as_str), Some("solverA -x"));
        assert_eq!(loaded.instances.get("instance1").map(String::as_str), Some("foo.cnf"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn setup_error_messages_carry_context() {
        let err = SetupError::MissingInstanceField {
            config_file: "configs.txt".to_string(),
            config_line: 3,
            instance_file: "instances.txt".to_string(),
            instance_line: 7,
            index: 2,
            provided: 1,
            content: "foo.cnf".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("configs.txt:L3"));
        assert!(msg.contains("instances.txt:L7"));
        assert!(msg.contains("$2"));
        assert!(msg.contains("foo.cnf"));
    }
}
