use anyhow::Result;
use ferro_core::{LabelMap, Metadata};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Flat field mapping contributed by a parser or extractor.
pub type RecordFields = BTreeMap<String, Value>;

/// One mined run: `config`, `instance`, `run` plus whatever the parsers
/// contributed.
pub type RunRecord = BTreeMap<String, Value>;

/// Knobs for one mining pass. The primary-log parser itself is passed to
/// [`process_bench`] since its type is caller-supplied.
#[derive(Default)]
pub struct MineOptions {
    /// Label side-table written at generation time; without it, records
    /// carry the raw directory IDs.
    pub metadata: Option<Metadata>,
    /// Secondary parser applied to `stderr.log`. Its fields never override
    /// primary-log fields.
    pub error_parser: Option<Box<dyn Fn(&Path) -> Option<RecordFields>>>,
    pub node_info: bool,
    pub runsolver_stats: bool,
    pub perf_stats: bool,
}

/// Builds a parser from a pattern with named capture groups; each group
/// that participates in the match becomes one string field.
pub fn regex_parser(pattern: Regex) -> impl Fn(&Path) -> Option<RecordFields> {
    move |path| {
        let text = fs::read_to_string(path).ok()?;
        let caps = pattern.captures(&text)?;
        let mut fields = RecordFields::new();
        for name in pattern.capture_names().flatten() {
            if let Some(m) = caps.name(name) {
                fields.insert(name.to_string(), Value::String(m.as_str().to_string()));
            }
        }
        if fields.is_empty() {
            None
        } else {
            Some(fields)
        }
    }
}

/// Inserts `fields` into `record` without clobbering anything already
/// there. Calling this in precedence order gives the documented merge:
/// identity fields, then primary log, then error log, then
/// instrumentation.
fn merge_missing(record: &mut RunRecord, fields: RecordFields) {
    for (key, value) in fields {
        record.entry(key).or_insert(value);
    }
}

fn resolve_label(table: Option<&LabelMap>, id: &str) -> String {
    match table {
        Some(map) => match map.get(id) {
            Some(label) => label.clone(),
            None => {
                warn!(id, "metadata has no label for directory, using raw id");
                id.to_string()
            }
        },
        None => id.to_string(),
    }
}

/// Walks `base/config*/instance*/run*/` and yields one record per run
/// whose primary log exists and parses to a non-empty result. Partially
/// populated trees (jobs still running or never started) are fine; such
/// runs are skipped, never reported as empty records.
pub fn process_bench<F>(bench_dir: &Path, parser: F, options: &MineOptions) -> Result<Vec<RunRecord>>
where
    F: Fn(&Path) -> Option<RecordFields>,
{
    let mut records = Vec::new();
    for entry in WalkDir::new(bench_dir)
        .min_depth(3)
        .max_depth(3)
        .sort_by_file_name()
    {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let rel = entry.path().strip_prefix(bench_dir)?;
        let mut parts = rel.iter().map(|c| c.to_string_lossy());
        let (Some(config_id), Some(instance_id), Some(run_name)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if !config_id.starts_with("config")
            || !instance_id.starts_with("instance")
            || !run_name.starts_with("run")
        {
            continue;
        }

        let run_dir = entry.path();
        let primary = run_dir.join("stdout.log");
        if !primary.is_file() {
            debug!(run = %run_dir.display(), "no primary log, skipping");
            continue;
        }
        let Some(parsed) = parser(&primary) else {
            debug!(run = %run_dir.display(), "parser returned no result, skipping");
            continue;
        };
        if parsed.is_empty() {
            continue;
        }

        let mut record = RunRecord::new();
        record.insert(
            "config".to_string(),
            Value::String(resolve_label(
                options.metadata.as_ref().map(|m| &m.configs),
                &config_id,
            )),
        );
        record.insert(
            "instance".to_string(),
            Value::String(resolve_label(
                options.metadata.as_ref().map(|m| &m.instances),
                &instance_id,
            )),
        );
        let run_index = run_name.strip_prefix("run").unwrap_or_default();
        record.insert("run".to_string(), Value::String(run_index.to_string()));
        merge_missing(&mut record, parsed);

        if let Some(error_parser) = &options.error_parser {
            let error_log = run_dir.join("stderr.log");
            if error_log.is_file() {
                if let Some(fields) = error_parser(&error_log) {
                    merge_missing(&mut record, fields);
                }
            }
        }
        if options.node_info {
            if let Some(fields) = parse_node_info(&run_dir.join("node_info.log")) {
                merge_missing(&mut record, fields);
            }
        }
        if options.runsolver_stats {
            if let Some(fields) = parse_runsolver_stats(&run_dir.join("runsolver.log")) {
                merge_missing(&mut record, fields);
            }
        }
        if options.perf_stats {
            if let Some(fields) = parse_perf_stats(&run_dir.join("perf.log")) {
                merge_missing(&mut record, fields);
            }
        }
        records.push(record);
    }
    Ok(records)
}

/// Regex variant of [`process_bench`], for callers whose whole parser is
/// one pattern with named groups.
pub fn process_bench_regex(
    bench_dir: &Path,
    pattern: Regex,
    options: &MineOptions,
) -> Result<Vec<RunRecord>> {
    process_bench(bench_dir, regex_parser(pattern), options)
}

/// `node_info.log` is three fixed lines written by the job wrapper:
/// date, hostname and the `Cpus_allowed:` mask from /proc/self/status.
pub fn parse_node_info(path: &Path) -> Option<RecordFields> {
    let text = fs::read_to_string(path).ok()?;
    let mut fields = RecordFields::new();
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("Date: ") {
            fields.insert(
                "node_date".to_string(),
                Value::String(rest.trim().to_string()),
            );
        } else if let Some(rest) = line.strip_prefix("Node: ") {
            fields.insert("node".to_string(), Value::String(rest.trim().to_string()));
        } else if let Some(rest) = line.strip_prefix("Cpus_allowed:") {
            fields.insert(
                "cpus_allowed".to_string(),
                Value::String(rest.trim().to_string()),
            );
        }
    }
    if fields.is_empty() {
        None
    } else {
        Some(fields)
    }
}

/// Pulls peak memory and user/system time out of the resource monitor's
/// watcher log.
pub fn parse_runsolver_stats(path: &Path) -> Option<RecordFields> {
    let text = fs::read_to_string(path).ok()?;
    let mut fields = RecordFields::new();
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("maximum resident set size=") {
            if let Ok(value) = rest.trim().parse::<u64>() {
                fields.insert("max_rss_kb".to_string(), Value::from(value));
            }
        } else if let Some(rest) = line.strip_prefix("user time used=") {
            if let Ok(value) = rest.trim().parse::<f64>() {
                fields.insert("user_time".to_string(), Value::from(value));
            }
        } else if let Some(rest) = line.strip_prefix("system time used=") {
            if let Ok(value) = rest.trim().parse::<f64>() {
                fields.insert("system_time".to_string(), Value::from(value));
            }
        }
    }
    if fields.is_empty() {
        None
    } else {
        Some(fields)
    }
}

/// Parses `perf stat -B` output positionally: header lines are skipped,
/// each event line is `<value> <event> ...` with thousands separators in
/// the value, and the trailing timing lines carry elapsed/user/sys
/// seconds. Events reported as `<not counted>` or `<not supported>` are
/// dropped.
pub fn parse_perf_stats(path: &Path) -> Option<RecordFields> {
    let text = fs::read_to_string(path).ok()?;
    let mut fields = RecordFields::new();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("Performance counter stats")
        {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 2 || tokens[0].starts_with('<') {
            continue;
        }
        if tokens[1] == "seconds" {
            let value: f64 = match tokens[0].parse() {
                Ok(v) => v,
                Err(_) => continue,
            };
            match tokens.get(2).copied() {
                Some("time") => {
                    fields.insert("elapsed_s".to_string(), Value::from(value));
                }
                Some("user") => {
                    fields.insert("user_s".to_string(), Value::from(value));
                }
                Some("sys") => {
                    fields.insert("sys_s".to_string(), Value::from(value));
                }
                _ => {}
            }
            continue;
        }
        let digits = tokens[0].replace(',', "");
        if let Ok(value) = digits.parse::<u64>() {
            let event = tokens[1].replace('-', "_");
            fields.insert(event, Value::from(value));
        }
    }
    if fields.is_empty() {
        None
    } else {
        Some(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_dir(tag: &str) -> PathBuf {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "ferro_mine_{}_{}_{}",
            tag,
            std::process::id(),
            nanos
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    fn write_run(base: &Path, config: &str, instance: &str, run: &str, stdout: Option<&str>) {
        let dir = base.join(config).join(instance).join(run);
        fs::create_dir_all(&dir).expect("run dir");
        if let Some(text) = stdout {
            fs::write(dir.join("stdout.log"), text).expect("stdout");
        }
    }

    fn cost_pattern() -> Regex {
        Regex::new(r"(?:Optimization: |Cost: )(?P<cost>\d+)").expect("pattern")
    }

    fn demo_metadata() -> Metadata {
        let mut configs = LabelMap::new();
        configs.insert("config1".to_string(), "solverA -x".to_string());
        let mut instances = LabelMap::new();
        instances.insert("instance1".to_string(), "foo.cnf".to_string());
        Metadata { instances, configs }
    }

    #[test]
    fn round_trip_resolves_labels() {
        let dir = temp_dir("roundtrip");
        write_run(&dir, "config1", "instance1", "run1", Some("done\nCost: 42\n"));

        let options = MineOptions {
            metadata: Some(demo_metadata()),
            ..MineOptions::default()
        };
        let records = process_bench_regex(&dir, cost_pattern(), &options).expect("mine");
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record["config"], Value::String("solverA -x".to_string()));
        assert_eq!(record["instance"], Value::String("foo.cnf".to_string()));
        assert_eq!(record["run"], Value::String("1".to_string()));
        assert_eq!(record["cost"], Value::String("42".to_string()));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_metadata_falls_back_to_directory_ids() {
        let dir = temp_dir("rawids");
        write_run(&dir, "config2", "instance7", "run3", Some("Cost: 1\n"));
        let records =
            process_bench_regex(&dir, cost_pattern(), &MineOptions::default()).expect("mine");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["config"], Value::String("config2".to_string()));
        assert_eq!(records[0]["instance"], Value::String("instance7".to_string()));
        assert_eq!(records[0]["run"], Value::String("3".to_string()));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn runs_without_primary_log_or_match_yield_no_record() {
        let dir = temp_dir("skips");
        // no stdout.log at all
        write_run(&dir, "config1", "instance1", "run1", None);
        // stdout.log present but the parser finds nothing
        write_run(&dir, "config1", "instance1", "run2", Some("no result here\n"));
        // secondary logs alone never produce a record
        fs::write(
            dir.join("config1/instance1/run1/stderr.log"),
            "Cost: 9\n",
        )
        .expect("stderr");

        let options = MineOptions {
            error_parser: Some(Box::new(regex_parser(cost_pattern()))),
            ..MineOptions::default()
        };
        let records = process_bench(&dir, regex_parser(cost_pattern()), &options).expect("mine");
        assert!(records.is_empty());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn unrelated_directories_are_ignored() {
        let dir = temp_dir("unrelated");
        write_run(&dir, "config1", "instance1", "run1", Some("Cost: 2\n"));
        fs::create_dir_all(dir.join("slurm_logs/a/b")).expect("logs dir");
        fs::create_dir_all(dir.join("config1/instance1/notes")).expect("notes dir");
        let records =
            process_bench_regex(&dir, cost_pattern(), &MineOptions::default()).expect("mine");
        assert_eq!(records.len(), 1);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn primary_fields_win_over_error_fields() {
        let dir = temp_dir("precedence");
        write_run(&dir, "config1", "instance1", "run1", Some("status: sat\n"));
        fs::write(
            dir.join("config1/instance1/run1/stderr.log"),
            "status: crashed\ndetail: oom\n",
        )
        .expect("stderr");

        let primary =
            regex_parser(Regex::new(r"status: (?P<status>\w+)").expect("primary pattern"));
        let secondary = regex_parser(
            Regex::new(r"status: (?P<status>\w+)\ndetail: (?P<detail>\w+)").expect("error pattern"),
        );
        let options = MineOptions {
            error_parser: Some(Box::new(secondary)),
            ..MineOptions::default()
        };
        let records = process_bench(&dir, primary, &options).expect("mine");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["status"], Value::String("sat".to_string()));
        assert_eq!(records[0]["detail"], Value::String("oom".to_string()));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn records_come_out_in_directory_order() {
        let dir = temp_dir("order");
        write_run(&dir, "config1", "instance1", "run1", Some("Cost: 1\n"));
        write_run(&dir, "config1", "instance1", "run2", Some("Cost: 2\n"));
        write_run(&dir, "config2", "instance1", "run1", Some("Cost: 3\n"));
        let records =
            process_bench_regex(&dir, cost_pattern(), &MineOptions::default()).expect("mine");
        let costs: Vec<_> = records.iter().map(|r| r["cost"].clone()).collect();
        assert_eq!(
            costs,
            vec![
                Value::String("1".to_string()),
                Value::String("2".to_string()),
                Value::String("3".to_string())
            ]
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn node_info_grammar() {
        let dir = temp_dir("nodeinfo");
        let path = dir.join("node_info.log");
        fs::write(
            &path,
            "Date: Thu Aug  7 10:12:01 CEST 2026\nNode: taurusi8021\nCpus_allowed:\tff,00000000\n",
        )
        .expect("node info");
        let fields = parse_node_info(&path).expect("fields");
        assert_eq!(
            fields["node_date"],
            Value::String("Thu Aug  7 10:12:01 CEST 2026".to_string())
        );
        assert_eq!(fields["node"], Value::String("taurusi8021".to_string()));
        assert_eq!(fields["cpus_allowed"], Value::String("ff,00000000".to_string()));
        assert!(parse_node_info(&dir.join("missing.log")).is_none());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn runsolver_grammar() {
        let dir = temp_dir("runsolver");
        let path = dir.join("runsolver.log");
        fs::write(
            &path,
            "Child status: 0\nReal time (s): 4.20\nuser time used= 3.91\nsystem time used= 0.27\nmaximum resident set size= 182344\n",
        )
        .expect("runsolver log");
        let fields = parse_runsolver_stats(&path).expect("fields");
        assert_eq!(fields["max_rss_kb"], Value::from(182344u64));
        assert_eq!(fields["user_time"], Value::from(3.91));
        assert_eq!(fields["system_time"], Value::from(0.27));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn perf_grammar_strips_separators_and_skips_uncounted() {
        let dir = temp_dir("perf");
        let path = dir.join("perf.log");
        fs::write(
            &path,
            "# started on Thu Aug  7 10:12:01 2026\n\n\
             Performance counter stats for './solver x.cnf':\n\n\
             \t   12,345,678      cache-references\n\
             \t    1,234,567      cache-misses              #   10.0 % of all cache refs\n\
             \t<not counted>      cycles\n\
             \t<not supported>    migrations\n\
             \t          942      context-switches\n\n\
             \t     4.201302 seconds time elapsed\n\n\
             \t     3.910000 seconds user\n\
             \t     0.270000 seconds sys\n",
        )
        .expect("perf log");
        let fields = parse_perf_stats(&path).expect("fields");
        assert_eq!(fields["cache_references"], Value::from(12_345_678u64));
        assert_eq!(fields["cache_misses"], Value::from(1_234_567u64));
        assert_eq!(fields["context_switches"], Value::from(942u64));
        assert!(!fields.contains_key("cycles"));
        assert!(!fields.contains_key("migrations"));
        assert_eq!(fields["elapsed_s"], Value::from(4.201302));
        assert_eq!(fields["user_s"], Value::from(3.91));
        assert_eq!(fields["sys_s"], Value::from(0.27));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn instrumentation_has_lowest_precedence() {
        let dir = temp_dir("instrument");
        write_run(&dir, "config1", "instance1", "run1", Some("Cost: 5\nnode: fromlog\n"));
        let run_dir = dir.join("config1/instance1/run1");
        fs::write(run_dir.join("node_info.log"), "Node: realnode\n").expect("node info");
        fs::write(run_dir.join("runsolver.log"), "maximum resident set size= 10\n")
            .expect("runsolver");

        let parser = regex_parser(
            Regex::new(r"Cost: (?P<cost>\d+)\nnode: (?P<node>\w+)").expect("pattern"),
        );
        let options = MineOptions {
            node_info: true,
            runsolver_stats: true,
            ..MineOptions::default()
        };
        let records = process_bench(&dir, parser, &options).expect("mine");
        assert_eq!(records.len(), 1);
        // the primary log's `node` field survives the node_info merge
        assert_eq!(records[0]["node"], Value::String("fromlog".to_string()));
        assert_eq!(records[0]["max_rss_kb"], Value::from(10u64));
        let _ = fs::remove_dir_all(dir);
    }
}
