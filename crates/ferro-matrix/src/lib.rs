use anyhow::{anyhow, Context, Result};
use ferro_core::{
    atomic_write_bytes, ensure_dir, expand_tilde, home_relative, make_executable, BenchConfig,
    ListEntry, Metadata, NamedSet, SetupError,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Hardware events sampled when perf wrapping is enabled.
const PERF_EVENTS: [&str; 8] = [
    "cache-references",
    "cache-misses",
    "cycles",
    "instructions",
    "branches",
    "faults",
    "migrations",
    "context-switches",
];

const ARCHIVE_EXTENSIONS: [&str; 5] = ["lzma", "zip", "gz", "xz", "bz2"];

/// A file (or directory) copied into the job's staging area before the
/// command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub origin: PathBuf,
    pub staging: PathBuf,
    pub directory: bool,
}

/// Per-job staging registry. Staging names must be unique within one job;
/// on collision the later registration is renamed `stem<count>suffix` and
/// the first occurrence keeps the bare name.
#[derive(Debug)]
pub struct StagingArea {
    input_dir: PathBuf,
    occupied: HashMap<String, u32>,
    files: Vec<StagedFile>,
}

impl StagingArea {
    pub fn new(staging_root: &Path) -> Self {
        StagingArea {
            input_dir: staging_root.join("input"),
            occupied: HashMap::new(),
            files: Vec::new(),
        }
    }

    pub fn register(&mut self, origin: PathBuf) -> PathBuf {
        self.register_inner(origin, false)
    }

    pub fn register_directory(&mut self, origin: PathBuf) -> PathBuf {
        self.register_inner(origin, true)
    }

    fn register_inner(&mut self, origin: PathBuf, directory: bool) -> PathBuf {
        let name = origin
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input".to_string());
        let staged_name = match self.occupied.get_mut(&name) {
            Some(count) => {
                let renamed = numbered_name(&name, *count);
                *count += 1;
                renamed
            }
            None => {
                self.occupied.insert(name.clone(), 1);
                name
            }
        };
        let staging = self.input_dir.join(staged_name);
        self.files.push(StagedFile {
            origin,
            staging: staging.clone(),
            directory,
        });
        staging
    }

    pub fn files(&self) -> &[StagedFile] {
        &self.files
    }
}

/// `x.cnf` + 1 -> `x1.cnf`; names without an extension get the counter
/// appended at the end.
fn numbered_name(name: &str, count: u32) -> String {
    match name.rfind('.') {
        Some(idx) if idx > 0 => format!("{}{}{}", &name[..idx], count, &name[idx..]),
        _ => format!("{}{}", name, count),
    }
}

/// Everything the templater needs besides the two source lines.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub definition_dir: &'a Path,
    pub working_dir: Option<&'a Path>,
    /// Already multiplied by the timeout factor.
    pub timeout: u64,
    pub executable: Option<&'a str>,
}

#[derive(Debug)]
pub struct ResolvedCommand {
    pub command: String,
    /// (staged archive, decompression target) pairs, in field order.
    pub uncompress: Vec<(PathBuf, PathBuf)>,
}

fn resolve_origin(ctx: &TemplateContext, raw: &str) -> PathBuf {
    let expanded = expand_tilde(Path::new(raw));
    if expanded.is_absolute() {
        expanded
    } else {
        ctx.working_dir
            .unwrap_or(ctx.definition_dir)
            .join(expanded)
    }
}

fn strip_archive_extension(path: &Path) -> Option<PathBuf> {
    let ext = path.extension()?.to_string_lossy().to_ascii_lowercase();
    if ARCHIVE_EXTENSIONS.contains(&ext.as_str()) {
        Some(path.with_extension(""))
    } else {
        None
    }
}

/// Rewrites every `$<key>{...}` occurrence through `f`, left to right.
fn rewrite_braced(
    cmd: &str,
    key: &str,
    mut f: impl FnMut(&str) -> Result<String>,
) -> Result<String> {
    let pattern = format!("${}{{", key);
    let mut out = String::with_capacity(cmd.len());
    let mut rest = cmd;
    while let Some(pos) = rest.find(&pattern) {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + pattern.len()..];
        let close = after
            .find('}')
            .ok_or_else(|| anyhow!("unterminated ${}{{...}} placeholder in '{}'", key, cmd))?;
        out.push_str(&f(&after[..close])?);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Rewrites every `$N` occurrence (longest digit run, so `$10` is field
/// ten) through `f`; returns the rewritten command and the set of indices
/// that were referenced.
fn rewrite_positional(
    cmd: &str,
    mut f: impl FnMut(usize) -> Result<String>,
) -> Result<(String, BTreeSet<usize>)> {
    let mut out = String::with_capacity(cmd.len());
    let mut used = BTreeSet::new();
    let mut rest = cmd;
    loop {
        match rest.find('$') {
            None => {
                out.push_str(rest);
                break;
            }
            Some(pos) => {
                out.push_str(&rest[..pos]);
                let after = &rest[pos + 1..];
                let digits = after.chars().take_while(|c| c.is_ascii_digit()).count();
                if digits == 0 || after.starts_with('0') {
                    out.push('$');
                    rest = after;
                } else {
                    let index: usize = after[..digits]
                        .parse()
                        .with_context(|| format!("positional index out of range in '{}'", cmd))?;
                    out.push_str(&f(index)?);
                    used.insert(index);
                    rest = &after[digits..];
                }
            }
        }
    }
    Ok((out, used))
}

/// Expands one config line against one instance line into a concrete shell
/// command, registering every input file with the job's staging area.
///
/// Resolution order is fixed: `$file{}` and `$folder{}` first, then
/// positional instance fields, then unreferenced fields appended, then
/// `$timeout` and `$seed`.
pub fn resolve_command(
    ctx: &TemplateContext,
    config: &ListEntry,
    instance: &ListEntry,
    area: &mut StagingArea,
    rng: &mut StdRng,
) -> Result<ResolvedCommand> {
    // a config line of literal `None` means "no arguments"
    let config_text = if config.label == "None" {
        ""
    } else {
        config.label.as_str()
    };
    let mut cmd = match ctx.executable {
        Some(exe) => format!("{} {}", exe, config_text),
        None => config_text.to_string(),
    };

    cmd = rewrite_braced(&cmd, "file", |raw| {
        let staged = area.register(resolve_origin(ctx, raw));
        Ok(staged.display().to_string())
    })?;
    cmd = rewrite_braced(&cmd, "folder", |raw| {
        let staged = area.register_directory(resolve_origin(ctx, raw));
        Ok(staged.display().to_string())
    })?;

    let fields: Vec<&str> = instance
        .label
        .split([';', ',', ' '])
        .filter(|t| !t.is_empty())
        .collect();

    let mut seen: HashMap<String, PathBuf> = HashMap::new();
    let mut field_paths: Vec<PathBuf> = Vec::new();
    let mut uncompress = Vec::new();
    for raw in &fields {
        let origin = resolve_origin(ctx, raw);
        let name = origin
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| raw.to_string());
        match seen.get(&name) {
            Some(first) if *first != origin => {
                return Err(SetupError::AmbiguousDuplicate {
                    name,
                    first: first.clone(),
                    second: origin,
                }
                .into());
            }
            Some(_) => {}
            None => {
                seen.insert(name, origin.clone());
            }
        }
        let staged = area.register(origin);
        // the command must reference the decompressed sibling, not the archive
        if let Some(target) = strip_archive_extension(&staged) {
            uncompress.push((staged, target.clone()));
            field_paths.push(target);
        } else {
            field_paths.push(staged);
        }
    }

    let (rewritten, used) = rewrite_positional(&cmd, |index| {
        let path = field_paths.get(index - 1).ok_or_else(|| {
            anyhow::Error::from(SetupError::MissingInstanceField {
                config_file: file_name_string(&config.file),
                config_line: config.line,
                instance_file: file_name_string(&instance.file),
                instance_line: instance.line,
                index,
                provided: field_paths.len(),
                content: instance.label.clone(),
            })
        })?;
        Ok(path.display().to_string())
    })?;
    cmd = rewritten;

    for (i, path) in field_paths.iter().enumerate() {
        if !used.contains(&(i + 1)) {
            cmd.push(' ');
            cmd.push_str(&path.display().to_string());
        }
    }

    // one draw per job, whether or not the line asks for a seed, so the
    // seed sequence only depends on generation order
    let seed = rng.gen_range(0..=1u64 << 32);
    cmd = cmd.replace("$timeout", &ctx.timeout.to_string());
    cmd = cmd.replace("$seed", &seed.to_string());

    Ok(ResolvedCommand { command: cmd, uncompress })
}

fn file_name_string(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Resource request derived from the benchmark definition: CPUs are
/// rounded up to whole memory-controller domains so cache slices are never
/// shared across jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlurmAllocation {
    pub cpus: u32,
    pub cache_lines: u32,
    pub mem_per_cpu: u64,
    pub wall_seconds: u64,
}

pub fn compute_allocation(config: &BenchConfig) -> SlurmAllocation {
    let unit = config.cpus_per_node as f64 / config.mem_lines as f64;
    let cpus = (((config.request_cpus as f64 / unit).ceil() * unit) as u32).max(1);
    let cache_lines = cpus / config.mem_lines;
    let mem_per_cpu = config.mem_limit.div_ceil(cpus as u64);
    let wall_seconds = config.timeout + config.slurm_time_buffer + config.runsolver_kill_delay;
    SlurmAllocation {
        cpus,
        cache_lines,
        mem_per_cpu,
        wall_seconds,
    }
}

fn format_hms(total: u64) -> String {
    format!(
        "{}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

struct ScriptParams<'a> {
    staging_root: &'a Path,
    job_dir: &'a Path,
    /// Set only when a working directory is declared and symlinking is on.
    symlink_dir: Option<&'a Path>,
    staged: &'a [StagedFile],
    uncompress: &'a [(PathBuf, PathBuf)],
    command: &'a str,
}

const UNCOMPRESS_HELPER: &str = r#"uncompress () {
    filename=$1
    output=$2
    type=$(file -b --mime-type $filename)
    echo "Compressed file recognized as: " $type

    if [ $type == "application/x-lzma" ] ; then
         prep_cmd="lzcat $filename"
    elif [ $type == "application/x-bzip2" ] ; then
         prep_cmd="bzcat $filename"
    elif [ $type == "application/x-xz" ] ; then
         prep_cmd="xzcat $filename"
    elif [ $type == "application/octet-stream" ] ; then
         prep_cmd="lzcat $filename"
    else
         prep_cmd="zcat -f $filename"
    fi
    echo "Preparing instance in $output"
    echo "$prep_cmd > $output"
    $prep_cmd > $output
}
"#;

/// Renders the per-job execution wrapper. The trap is installed before any
/// staging happens and `_cleanup` runs on both the normal and the
/// preempted path, so the staging root never outlives the job.
fn render_start_script(p: &ScriptParams) -> String {
    let staging_root = p.staging_root.display();
    let mut s = String::new();
    s.push_str("#!/usr/bin/env bash\n\n");
    s.push_str(UNCOMPRESS_HELPER);
    s.push('\n');

    s.push_str("_cleanup() {\n");
    if p.symlink_dir.is_some() {
        s.push_str("\t# cleanup symlinks\n");
        s.push_str("\tfind . -type l -delete\n");
    }
    s.push_str("\t# copy output into run dir\n");
    s.push_str(&format!("\tcp * {}\n", home_relative(p.job_dir)));
    s.push_str("\t# cleanup shm files\n");
    s.push_str(&format!("\trm -rf {}/\n", staging_root));
    s.push_str("}\n\n");

    s.push_str("_term() {\n");
    s.push_str("\tkill -TERM \"$child\" 2>/dev/null\n");
    s.push_str("\t_cleanup\n");
    s.push_str("}\n\n");
    s.push_str("trap _term SIGTERM\n\n");

    s.push_str("# change into job directory\n");
    s.push_str(&format!("mkdir {}\n", staging_root));
    s.push_str(&format!("cd {}\n", staging_root));
    s.push_str("mkdir input\n");
    s.push_str("mkdir output\n");
    s.push_str("cd output\n");
    if let Some(wd) = p.symlink_dir {
        s.push_str("# create log files (so that symlinks cannot interfere)\n");
        s.push_str("touch runsolver.log stdout.log stderr.log\n");
        s.push_str("# create symlinks for working directory\n");
        s.push_str(&format!("ln -s {}/* .\n", home_relative(wd)));
    }
    s.push_str("# move input files into shared mem\n");
    for file in p.staged {
        let flag = if file.directory { " -r" } else { "" };
        s.push_str(&format!(
            "cp{} {} {}\n",
            flag,
            home_relative(&file.origin),
            file.staging.display()
        ));
    }
    s.push_str("# uncompress input files\n");
    for (archive, target) in p.uncompress {
        s.push_str(&format!(
            "uncompress {} {}\n",
            archive.display(),
            target.display()
        ));
    }
    s.push_str("# store node info\n");
    s.push_str("echo Date: $(date) > node_info.log\n");
    s.push_str("echo Node: $(hostname) >> node_info.log\n");
    s.push_str("cat /proc/self/status | grep Cpus_allowed: >> node_info.log\n");
    s.push_str("# execute run\n");
    s.push_str(p.command);
    s.push_str(" &\n");
    s.push_str("child=$!\n");
    s.push_str("wait \"$child\"\n");
    s.push_str("_cleanup\n");
    s
}

/// Wraps the resolved solver command with the resource monitor and, when
/// enabled, perf sampling. The monitor's wall clock gets the scheduler
/// buffer on top of the raw timeout; the kill delay is only added to the
/// scheduler allocation.
fn wrap_command(
    config: &BenchConfig,
    runsolver: &Path,
    perf: Option<&Path>,
    solver_cmd: &str,
) -> String {
    let monitor_time = config.timeout + config.slurm_time_buffer;
    let monitor = format!(
        "{} -w runsolver.log -v varfile.log -W {} -V {} -d {}",
        runsolver.display(),
        monitor_time,
        config.mem_limit,
        config.runsolver_kill_delay
    );
    let solver = format!("{} 2> stderr.log 1> stdout.log", solver_cmd);
    match perf {
        Some(perf) => format!(
            "{} {} stat -o perf.log -B -e {} {}",
            monitor,
            perf.display(),
            PERF_EVENTS.join(","),
            solver
        ),
        None => format!("{} {}", monitor, solver),
    }
}

#[derive(Debug)]
pub struct BenchmarkReport {
    pub label: String,
    pub root: PathBuf,
    pub jobs: usize,
}

#[derive(Debug, Default)]
pub struct GenerateReport {
    pub benchmarks: Vec<BenchmarkReport>,
}

impl GenerateReport {
    pub fn total_jobs(&self) -> usize {
        self.benchmarks.iter().map(|b| b.jobs).sum()
    }
}

/// Loads the config set. Multi-entry config sources are concatenated into
/// one set with a continuous ID sequence, so every benchmark tree sees the
/// same `configN` naming.
fn load_config_set(config: &BenchConfig, definition_dir: &Path) -> Result<NamedSet> {
    let resolved = config.configs.resolve(&config.name);
    let mut set = NamedSet::default();
    for entry in &resolved.entries {
        let path = absolutize(&entry.list_file, definition_dir);
        set.append_list_file("config", &path)?;
    }
    Ok(set)
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    let expanded = expand_tilde(path);
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

/// Expands the config/instance cross product into job directories, scripts
/// and scheduler artifacts under `out_dir`. Generation is sequential and
/// deterministic: configs outer, instances inner, then the 1-based run
/// index; that order is also the array-index order in `start_list.txt`.
pub fn generate(config: &BenchConfig, definition_dir: &Path, out_dir: &Path) -> Result<GenerateReport> {
    let out_dir = out_dir
        .canonicalize()
        .unwrap_or_else(|_| out_dir.to_path_buf());
    let mut rng = match config.initial_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let working_dir = config.resolved_working_dir(definition_dir);
    let allocation = compute_allocation(config);
    let configs = load_config_set(config, definition_dir)?;
    let instance_sources = config.instances.resolve(&config.name);

    let ctx = TemplateContext {
        definition_dir,
        working_dir: working_dir.as_deref(),
        timeout: config.effective_timeout(),
        executable: config.executable.as_deref(),
    };

    let mut report = GenerateReport::default();
    for source in &instance_sources.entries {
        let list_path = absolutize(&source.list_file, definition_dir);
        let instances = NamedSet::from_list_file("instance", &list_path)?;
        let bench_root = out_dir
            .join(&instance_sources.dir_prefix)
            .join(&source.label);
        if bench_root.exists() {
            if !config.overwrite {
                return Err(SetupError::DirectoryExists(bench_root).into());
            }
        } else {
            ensure_dir(&bench_root)?;
        }

        let mut start_scripts: Vec<String> = Vec::new();
        for config_entry in configs.iter() {
            for instance_entry in instances.iter() {
                for run in 1..=config.runs {
                    let job_dir = bench_root
                        .join(&config_entry.id)
                        .join(&instance_entry.id)
                        .join(format!("run{}", run));
                    if job_dir.exists() {
                        if !config.overwrite {
                            return Err(SetupError::DirectoryExists(job_dir).into());
                        }
                    } else {
                        ensure_dir(&job_dir)?;
                    }

                    let staging_root = PathBuf::from(format!("/dev/shm/{}", Uuid::new_v4()));
                    let mut area = StagingArea::new(&staging_root);
                    let resolved =
                        resolve_command(&ctx, config_entry, instance_entry, &mut area, &mut rng)?;

                    let runsolver = area.register(config.runsolver_path.clone());
                    let perf = config
                        .use_perf
                        .then(|| area.register(PathBuf::from("/usr/bin/perf")));
                    let wrapped =
                        wrap_command(config, &runsolver, perf.as_deref(), &resolved.command);

                    let script = render_start_script(&ScriptParams {
                        staging_root: &staging_root,
                        job_dir: &job_dir,
                        symlink_dir: working_dir
                            .as_deref()
                            .filter(|_| config.symlink_working_dir),
                        staged: area.files(),
                        uncompress: &resolved.uncompress,
                        command: &wrapped,
                    });
                    let script_path = job_dir.join("start.sh");
                    fs::write(&script_path, script).with_context(|| {
                        format!("failed to write job script {}", script_path.display())
                    })?;
                    make_executable(&script_path)?;
                    debug!(job = %script_path.display(), "rendered job script");

                    start_scripts.push(format!(
                        "{}/{}/run{}/start.sh",
                        config_entry.id, instance_entry.id, run
                    ));
                }
            }
        }

        Metadata::new(&instances, &configs).store(&bench_root.join("metadata.json"))?;
        let start_list: String = start_scripts
            .iter()
            .map(|s| format!("{}\n", s))
            .collect();
        atomic_write_bytes(&bench_root.join("start_list.txt"), start_list.as_bytes())?;
        write_slurm_artifacts(
            config,
            &allocation,
            &bench_root,
            &source.label,
            start_scripts.len(),
        )?;

        info!(
            benchmark = %source.label,
            jobs = start_scripts.len(),
            root = %bench_root.display(),
            "generated benchmark tree"
        );
        report.benchmarks.push(BenchmarkReport {
            label: source.label.clone(),
            root: bench_root,
            jobs: start_scripts.len(),
        });
    }
    Ok(report)
}

/// Writes the array-job descriptor, the chained compression job and the
/// submit-all script for one benchmark tree.
fn write_slurm_artifacts(
    config: &BenchConfig,
    allocation: &SlurmAllocation,
    bench_root: &Path,
    label: &str,
    job_count: usize,
) -> Result<()> {
    let bench_home = home_relative(bench_root);

    let mut batch = String::new();
    batch.push_str("#!/bin/bash\n#\n");
    batch.push_str(&format!("#SBATCH --job-name={}\n", label));
    batch.push_str(&format!(
        "#SBATCH --time={}\n",
        format_hms(allocation.wall_seconds)
    ));
    batch.push_str(&format!("#SBATCH --partition={}\n", config.partition));
    batch.push_str(&format!("#SBATCH --cpus-per-task={}\n", allocation.cpus));
    batch.push_str(&format!(
        "#SBATCH --mem-per-cpu={}\n",
        allocation.mem_per_cpu
    ));
    if let Some(email) = &config.email {
        batch.push_str(&format!("#SBATCH --mail-user={}\n", email));
        batch.push_str("#SBATCH --mail-type=end\n");
    }
    if let Some(account) = &config.billing {
        batch.push_str(&format!("#SBATCH --account={}\n", account));
    }
    if config.cache_pinning {
        batch.push_str(&format!(
            "#SBATCH --gres=cache:{}\n",
            allocation.cache_lines
        ));
    }
    let khz = config.cpu_freq * 1000;
    batch.push_str(&format!(
        "#SBATCH --cpu-freq={}-{}:performance\n",
        khz, khz
    ));
    if config.write_scheduler_logs {
        let log_dir = bench_root.join("slurm_logs");
        ensure_dir(&log_dir)?;
        batch.push_str(&format!(
            "#SBATCH --output={}/slurm-stdout_%A_%a.log\n",
            log_dir.display()
        ));
        batch.push_str(&format!(
            "#SBATCH --error={}/slurm-stderr_%A_%a.log\n",
            log_dir.display()
        ));
    } else {
        batch.push_str("#SBATCH --output=/dev/null\n");
        batch.push_str("#SBATCH --error=/dev/null\n");
    }
    match config.max_parallel_jobs {
        Some(cap) => batch.push_str(&format!("#SBATCH --array=1-{}%{}\n", job_count, cap)),
        None => batch.push_str(&format!("#SBATCH --array=1-{}\n", job_count)),
    }
    if config.exclusive {
        batch.push_str("#SBATCH --exclusive=user\n");
    }
    batch.push_str("#SBATCH --ntasks=1\n\n");
    batch.push_str(&format!("cd {}\n", bench_home));
    batch.push_str("start=$( awk \"NR==$SLURM_ARRAY_TASK_ID\" start_list.txt )\n");
    batch.push_str("srun $start\n");
    atomic_write_bytes(&bench_root.join("batch_job.slurm"), batch.as_bytes())?;

    let mut compress = String::new();
    compress.push_str("#!/bin/bash\n#\n");
    compress.push_str(&format!("#SBATCH --job-name={}_compress\n", label));
    compress.push_str(&format!("#SBATCH --partition={}\n", config.partition));
    compress.push_str("#SBATCH --cpus-per-task=1\n");
    compress.push_str("#SBATCH --output=/dev/null\n");
    compress.push_str("#SBATCH --error=/dev/null\n");
    compress.push_str("#SBATCH --ntasks=1\n\n");
    compress.push_str(&format!("cd {}\n", bench_home));
    compress.push_str("cd ..\n");
    compress.push_str(&format!("srun tar czf {}.tar.gz {}\n", label, label));
    atomic_write_bytes(&bench_root.join("compress_results.slurm"), compress.as_bytes())?;

    let mut submit = String::new();
    submit.push_str("#!/bin/bash\n#\n");
    submit.push_str(&format!("cd {}\n", bench_home));
    submit.push_str("jid=$(sbatch --parsable batch_job.slurm)\n");
    submit.push_str("sbatch --dependency=afterany:${jid} compress_results.slurm\n");
    let submit_path = bench_root.join("submit_all.sh");
    atomic_write_bytes(&submit_path, submit.as_bytes())?;
    make_executable(&submit_path)?;

    Ok(())
}

/// Per-benchmark counts for `describe`, computed without writing anything.
#[derive(Debug)]
pub struct MatrixSummary {
    pub label: String,
    pub instances: usize,
    pub jobs: usize,
}

pub fn summarize(config: &BenchConfig, definition_dir: &Path) -> Result<(Vec<MatrixSummary>, usize)> {
    let configs = load_config_set(config, definition_dir)?;
    let sources = config.instances.resolve(&config.name);
    let mut summaries = Vec::new();
    for source in &sources.entries {
        let list_path = absolutize(&source.list_file, definition_dir);
        let instances = NamedSet::from_list_file("instance", &list_path)?;
        summaries.push(MatrixSummary {
            label: source.label.clone(),
            instances: instances.len(),
            jobs: configs.len() * instances.len() * config.runs as usize,
        });
    }
    Ok((summaries, configs.len()))
}
