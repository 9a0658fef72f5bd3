mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use output::{
    CheckOutput, ExtraLink, InitOutput, MergeOutput, OutputWriter, RelocateOutput, StatusOutput,
    SyncOutput, TrackOutput, TrackedFile, UnlockOutput,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use worm_core::{
    CONFIG_FILE, CancelToken, Config, DepotRegistry, DepotSpec, LinkMode, ProbePolicy, Repository,
    Settings, merge_index_files,
};

/// Worm - write-once storage for large files in version-controlled repositories
#[derive(Parser)]
#[command(name = "worm")]
#[command(about = "Track large files by content hash and sync them with a depot", long_about = None)]
#[command(version)]
struct Cli {
    /// Repository directory (defaults to the enclosing repository of the current directory)
    #[arg(short = 'C', long, global = true)]
    repo: Option<PathBuf>,

    /// Configuration file (defaults to WORM_CONFIG env var or <repo>/.worm-config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cache directory (overrides WORM_CACHE_DIR and the configuration file)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Output results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize tracking in a repository
    Init {
        /// Depot URL to record in the configuration (e.g. file:///srv/depot)
        #[arg(long)]
        depot: Option<String>,

        /// How working files link to cached objects: hardlink, symlink or copy
        #[arg(long)]
        link_mode: Option<LinkMode>,
    },

    /// Track files, replacing them with read-only links into the cache
    Add {
        /// Files or directories to track
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Stop tracking files and remove them from the working tree
    Rm {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Move a tracked file
    Mv { src: PathBuf, dst: PathBuf },

    /// Copy a tracked file (shares the cached object)
    Cp { src: PathBuf, dst: PathBuf },

    /// Upload tracked content to the depot
    Push {
        /// Limit to these paths (default: everything tracked)
        paths: Vec<PathBuf>,
    },

    /// Download tracked content and link it into the working tree
    Pull {
        paths: Vec<PathBuf>,

        /// Only link content already in the cache
        #[arg(long)]
        offline: bool,

        /// Also hard-link the pulled content here (a directory when several files are pulled)
        #[arg(long)]
        extra: Option<PathBuf>,
    },

    /// Show where each tracked file's content is present
    Status {
        paths: Vec<PathBuf>,

        /// How to decide depot presence: ledger, live or offline
        #[arg(long)]
        probe: Option<ProbePolicy>,
    },

    /// Replace links with writable private copies for editing
    Unlock {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Verify cached objects and tracked working files
    Check,

    /// Merge two versions of the index file (for use as a merge driver)
    #[command(hide = true)]
    MergeDriver {
        ancestor: PathBuf,
        ours: PathBuf,
        theirs: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let output = OutputWriter::new(cli.json);
    match run(cli, &output) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            output.write_error(&e, 1);
            ExitCode::from(1)
        }
    }
}

/// Log to stderr, filtered by WORM_LOG (default: warnings and errors).
fn init_tracing() {
    let filter = EnvFilter::try_from_env("WORM_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Runs the command; `Ok(false)` means it completed with per-file failures.
fn run(cli: Cli, output: &OutputWriter) -> Result<bool> {
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let start = cli.repo.clone().unwrap_or_else(|| cwd.clone());
    let overrides = Overrides {
        config: cli.config.clone(),
        cache_dir: cli.cache_dir.as_ref().map(|dir| cwd.join(dir)),
    };

    let open = || -> Result<Repository> {
        let root = Repository::discover(&start)
            .with_context(|| format!("Failed to find repository from {}", start.display()))?;
        open_repository(&root, &overrides)
    };
    let abs = |paths: Vec<PathBuf>| -> Vec<PathBuf> { paths.into_iter().map(|p| cwd.join(p)).collect() };

    match cli.command {
        Commands::Init { depot, link_mode } => cmd_init(&start, &overrides, depot, link_mode, output),
        Commands::Add { paths } => cmd_add(&open()?, &abs(paths), output),
        Commands::Rm { paths } => cmd_rm(&open()?, &abs(paths), output),
        Commands::Mv { src, dst } => cmd_mv(&open()?, &cwd.join(src), &cwd.join(dst), false, output),
        Commands::Cp { src, dst } => cmd_mv(&open()?, &cwd.join(src), &cwd.join(dst), true, output),
        Commands::Push { paths } => cmd_push(&open()?, &abs(paths), output),
        Commands::Pull {
            paths,
            offline,
            extra,
        } => cmd_pull(
            &open()?,
            &abs(paths),
            offline,
            extra.map(|dir| cwd.join(dir)).as_deref(),
            output,
        ),
        Commands::Status { paths, probe } => cmd_status(&open()?, &abs(paths), probe, output),
        Commands::Unlock { paths } => cmd_unlock(&open()?, &abs(paths), output),
        Commands::Check => cmd_check(&open()?, output),
        Commands::MergeDriver {
            ancestor,
            ours,
            theirs,
        } => cmd_merge_driver(&ancestor, &ours, &theirs, output),
    }
}

struct Overrides {
    config: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
}

/// Configuration path: --config > WORM_CONFIG > <repo>/.worm-config.json
fn config_path(root: &Path, overrides: &Overrides) -> PathBuf {
    overrides
        .config
        .clone()
        .or_else(|| std::env::var_os("WORM_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| root.join(CONFIG_FILE))
}

/// Load configuration and apply the cache directory override
/// (--cache-dir > WORM_CACHE_DIR > configuration file > default).
fn load_config(root: &Path, overrides: &Overrides) -> Result<(Config, PathBuf)> {
    let path = config_path(root, overrides);
    let mut config = Config::load(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

    if let Some(cache_dir) = overrides
        .cache_dir
        .clone()
        .or_else(|| std::env::var_os("WORM_CACHE_DIR").map(PathBuf::from))
    {
        config.cache_dir = Some(cache_dir);
    }
    Ok((config, path))
}

fn open_repository(root: &Path, overrides: &Overrides) -> Result<Repository> {
    let (config, _) = load_config(root, overrides)?;
    let depot = config
        .open_depot(&DepotRegistry::with_builtins())
        .context("Failed to open depot")?;

    Repository::open(root, Settings::from_config(&config), depot)
        .with_context(|| format!("Failed to open repository at {}", root.display()))
}

/// Cancel outstanding transfers on Ctrl-C.
fn cancel_on_interrupt() -> CancelToken {
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        tracing::warn!(error = %e, "could not install interrupt handler");
    }
    cancel
}

fn cmd_init(
    root: &Path,
    overrides: &Overrides,
    depot: Option<String>,
    link_mode: Option<LinkMode>,
    output: &OutputWriter,
) -> Result<bool> {
    std::fs::create_dir_all(root)
        .with_context(|| format!("Failed to create directory {}", root.display()))?;
    let (mut config, path) = load_config(root, overrides)?;

    let mut changed = overrides.cache_dir.is_some();
    if let Some(url) = depot {
        config.depot = Some(DepotSpec::new(url));
        changed = true;
    }
    if let Some(mode) = link_mode {
        config.link_mode = mode;
        changed = true;
    }
    if changed {
        config.validate().context("Invalid configuration")?;
        config
            .save(&path)
            .with_context(|| format!("Failed to write configuration to {}", path.display()))?;
    }

    let depot = config
        .open_depot(&DepotRegistry::with_builtins())
        .context("Failed to open depot")?;
    let repo = Repository::init(root, Settings::from_config(&config), depot)
        .with_context(|| format!("Failed to initialize repository at {}", root.display()))?;

    let data = InitOutput {
        success: true,
        result_code: 0,
        root: repo.work_dir().display().to_string(),
        cache_dir: repo.store().root().display().to_string(),
        depot: repo.depot().map(|d| d.describe()),
    };
    output.write(&data, || {
        let mut text = format!("Initialized worm repository at {}\n", data.root);
        text.push_str(&format!("Cache: {}\n", data.cache_dir));
        if let Some(depot) = &data.depot {
            text.push_str(&format!("Depot: {}\n", depot));
        }
        text
    })?;
    Ok(true)
}

fn cmd_add(repo: &Repository, paths: &[PathBuf], output: &OutputWriter) -> Result<bool> {
    let added = repo.add(paths).context("Failed to add files")?;

    let data = TrackOutput {
        success: true,
        result_code: 0,
        files: added.into_iter().map(TrackedFile::from).collect(),
    };
    output.write(&data, || {
        data.files
            .iter()
            .map(|f| format!("{} {}\n", f.hash, f.path))
            .collect()
    })?;
    Ok(true)
}

fn cmd_rm(repo: &Repository, paths: &[PathBuf], output: &OutputWriter) -> Result<bool> {
    let removed = repo.rm(paths).context("Failed to remove files")?;

    let data = TrackOutput {
        success: true,
        result_code: 0,
        files: removed.into_iter().map(TrackedFile::from).collect(),
    };
    output.write(&data, || {
        data.files
            .iter()
            .map(|f| format!("Removed {}\n", f.path))
            .collect()
    })?;
    Ok(true)
}

fn cmd_mv(
    repo: &Repository,
    src: &Path,
    dst: &Path,
    copy: bool,
    output: &OutputWriter,
) -> Result<bool> {
    let verb = if copy { "copy" } else { "move" };
    let result = if copy { repo.cp(src, dst) } else { repo.mv(src, dst) };
    let (from, to, hash) = result.with_context(|| {
        format!("Failed to {} {} to {}", verb, src.display(), dst.display())
    })?;

    let data = RelocateOutput {
        success: true,
        result_code: 0,
        from,
        to,
        hash,
    };
    output.write(&data, || {
        format!(
            "{} {} -> {}\n",
            if copy { "Copied" } else { "Moved" },
            data.from,
            data.to
        )
    })?;
    Ok(true)
}

fn cmd_push(repo: &Repository, paths: &[PathBuf], output: &OutputWriter) -> Result<bool> {
    let report = repo
        .push(paths, cancel_on_interrupt())
        .context("Failed to push")?;

    let data = SyncOutput::from(&report);
    output.write(&data, || output::sync_text(&report))?;
    Ok(data.success)
}

fn cmd_pull(
    repo: &Repository,
    paths: &[PathBuf],
    offline: bool,
    extra: Option<&Path>,
    output: &OutputWriter,
) -> Result<bool> {
    let report = repo
        .pull(paths, cancel_on_interrupt(), offline)
        .context("Failed to pull")?;

    let mut data = SyncOutput::from(&report);
    if let Some(dest) = extra {
        let linked = repo
            .link_extra(paths, dest)
            .with_context(|| format!("Failed to link pulled content at {}", dest.display()))?;
        data.extra_links = linked.into_iter().map(ExtraLink::from).collect();
    }

    output.write(&data, || {
        let mut text = output::sync_text(&report);
        for link in &data.extra_links {
            text.push_str(&format!("Linked {} -> {}\n", link.path, link.link));
        }
        text
    })?;
    Ok(data.success)
}

fn cmd_status(
    repo: &Repository,
    paths: &[PathBuf],
    probe: Option<ProbePolicy>,
    output: &OutputWriter,
) -> Result<bool> {
    let policy = probe.unwrap_or(repo.settings().probe);
    let records = repo
        .status_with(paths, policy)
        .context("Failed to compute status")?;

    let data = StatusOutput {
        success: true,
        result_code: 0,
        files: records,
    };
    output.write(&data, || output::status_text(&data.files))?;
    Ok(true)
}

fn cmd_unlock(repo: &Repository, paths: &[PathBuf], output: &OutputWriter) -> Result<bool> {
    let unlocked = repo.unlock(paths).context("Failed to unlock files")?;

    let data = UnlockOutput {
        success: true,
        result_code: 0,
        unlocked,
    };
    output.write(&data, || {
        data.unlocked
            .iter()
            .map(|p| format!("Unlocked {}\n", p))
            .collect()
    })?;
    Ok(true)
}

fn cmd_check(repo: &Repository, output: &OutputWriter) -> Result<bool> {
    let report = repo.check().context("Failed to check repository")?;

    let data = CheckOutput::from(report);
    output.write(&data, || output::check_text(&data))?;
    Ok(data.success)
}

/// Entries are unioned and `theirs` wins conflicts, so the common ancestor
/// is not consulted.
fn cmd_merge_driver(ancestor: &Path, ours: &Path, theirs: &Path, output: &OutputWriter) -> Result<bool> {
    tracing::debug!(ancestor = %ancestor.display(), "merging index");
    let merged = merge_index_files(ours, theirs).with_context(|| {
        format!(
            "Failed to merge index {} into {}",
            theirs.display(),
            ours.display()
        )
    })?;

    let data = MergeOutput {
        success: true,
        result_code: 0,
        entries: merged.len(),
    };
    output.write(&data, || format!("Merged index: {} entries\n", data.entries))?;
    Ok(true)
}
