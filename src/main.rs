mod commands;
mod graph;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kiln_config::BuildScriptDef;
use kiln_engine::{BuildMode, BuildResultCode, Builder, BuilderConfig, LogLevel};

/// Kiln - an incremental build orchestrator
#[derive(Parser)]
#[command(name = "kiln")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the build directory (default: the user cache directory)
  #[arg(long, global = true)]
  build_path: Option<PathBuf>,

  /// Number of worker threads (default: available parallelism)
  #[arg(long, global = true)]
  threads: Option<usize>,

  /// Name of the index file written after a build
  #[arg(long, global = true, default_value = "index")]
  index_name: String,

  /// Mount an index file into the virtual file system before running,
  /// as PREFIX=INDEX. Inputs prefixed with `vfs:` resolve through it.
  #[arg(long = "mount", global = true, value_name = "PREFIX=INDEX", value_parser = parse_mount)]
  mounts: Vec<Mount>,

  /// Log debug output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Build every step of a script
  Build {
    /// Path to the build script (JSON)
    script: PathBuf,

    /// Merge into the existing index instead of replacing it
    #[arg(long)]
    merge_index: bool,
  },

  /// Forget cached results of a script's commands
  Clean {
    /// Path to the build script (JSON)
    script: PathBuf,

    /// Also delete the stored outputs and the index file
    #[arg(long)]
    delete: bool,
  },
}

/// An index file mounted at a virtual path prefix.
#[derive(Debug, Clone, PartialEq)]
struct Mount {
  prefix: String,
  index: PathBuf,
}

fn parse_mount(value: &str) -> Result<Mount, String> {
  let Some((prefix, index)) = value.split_once('=') else {
    return Err(format!("expected PREFIX=INDEX, got `{}`", value));
  };
  if !prefix.starts_with('/') {
    return Err(format!("mount prefix `{}` must start with `/`", prefix));
  }
  if index.is_empty() {
    return Err("missing index file after `=`".to_string());
  }
  Ok(Mount {
    prefix: prefix.to_string(),
    index: PathBuf::from(index),
  })
}

fn main() -> Result<()> {
  let cli = Cli::parse();
  init_logging(cli.verbose);

  let build_path = match cli.build_path {
    Some(path) => path,
    None => dirs::cache_dir()
      .context("could not determine cache directory")?
      .join("kiln"),
  };
  let mut config = BuilderConfig::new(build_path).with_index_name(cli.index_name);
  if let Some(threads) = cli.threads {
    config = config.with_thread_count(threads);
  }

  match cli.command {
    Some(Commands::Build {
      script,
      merge_index,
    }) => {
      let code = run(config, &cli.mounts, &script, BuildMode::Build, Some(merge_index))?;
      if code != BuildResultCode::Successful {
        bail!("build finished with {:?}", code);
      }
    }
    Some(Commands::Clean { script, delete }) => {
      let mode = if delete {
        BuildMode::CleanAndDelete
      } else {
        BuildMode::Clean
      };
      run(config, &cli.mounts, &script, mode, None)?;
    }
    None => {
      println!("kiln - use --help to see available commands");
    }
  }

  Ok(())
}

fn init_logging(verbose: bool) {
  let default = if verbose { "debug" } else { "info" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .init();
}

/// Run `script` in `mode`. `merge_index` is set for builds and selects how
/// the index file is written afterwards.
fn run(
  config: BuilderConfig,
  mounts: &[Mount],
  script_file: &Path,
  mode: BuildMode,
  merge_index: Option<bool>,
) -> Result<BuildResultCode> {
  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async { run_async(config, mounts, script_file, mode, merge_index).await })
}

async fn run_async(
  config: BuilderConfig,
  mounts: &[Mount],
  script_file: &Path,
  mode: BuildMode,
  merge_index: Option<bool>,
) -> Result<BuildResultCode> {
  let content = tokio::fs::read_to_string(script_file)
    .await
    .with_context(|| format!("failed to read build script: {}", script_file.display()))?;
  let script = BuildScriptDef::from_json(&content)
    .with_context(|| format!("failed to parse build script: {}", script_file.display()))?;

  let builder = Builder::new(config).context("failed to open build database")?;
  commands::register_builtin_commands(&builder);
  mount_indexes(&builder, mounts)?;
  let steps = graph::build_graph(&script, builder.registry())?;
  for step in &steps {
    builder.add_step(step.clone())?;
  }
  info!(
    script = %script.name.as_deref().unwrap_or("unnamed"),
    steps = steps.len(),
    ?mode,
    "build script loaded"
  );

  let builder = Arc::new(builder);
  let shutdown = CancellationToken::new();
  let watcher = tokio::spawn({
    let builder = builder.clone();
    let shutdown = shutdown.clone();
    async move {
      tokio::select! {
        result = tokio::signal::ctrl_c() => {
          if result.is_ok() {
            warn!("interrupt received, cancelling build");
            builder.cancel_build();
          }
        }
        _ = shutdown.cancelled() => {}
      }
    }
  });

  let report = tokio::task::spawn_blocking({
    let builder = builder.clone();
    move || builder.run(mode)
  })
  .await
  .context("build thread panicked")?;
  shutdown.cancel();
  let _ = watcher.await;
  let report = report.context("build aborted")?;

  print_failures(&steps);

  if let Some(merge) = merge_index
    && report.result == BuildResultCode::Successful
  {
    let index = builder
      .write_index_file(merge)
      .context("failed to write index file")?;
    eprintln!(
      "Wrote {} objects to {}",
      index.len(),
      builder.config().index_path().display()
    );
  }

  eprintln!(
    "{:?}: {} steps, {} failed",
    report.result,
    report.counts.total(),
    report.counts.failures()
  );
  Ok(report.result)
}

fn mount_indexes(builder: &Builder, mounts: &[Mount]) -> Result<()> {
  for mount in mounts {
    if !mount.index.exists() {
      bail!("index file not found: {}", mount.index.display());
    }
    builder
      .mount_index_file(&mount.prefix, &mount.index)
      .with_context(|| format!("failed to mount index: {}", mount.index.display()))?;
  }
  Ok(())
}

/// Print the warnings and errors of every failed step that ran below `steps`.
fn print_failures(steps: &[Arc<kiln_engine::BuildStep>]) {
  let mut pending: Vec<_> = steps.to_vec();
  while let Some(step) = pending.pop() {
    if step.failed() && step.log().has_errors() {
      eprintln!("{} failed:", step.title());
      for message in step.log().messages() {
        if message.level >= LogLevel::Warning {
          eprintln!("  {:?}: {}", message.level, message.text);
        }
      }
    }
    pending.extend(step.spawned_steps());
  }
}
