use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::PathBuf;
use std::process::Stdio;
use workflow_orchestrator::config_map::{ConfigMap, ConfigValues, DEFAULT_MOUNT_PATH};
use workflow_orchestrator::export::{OutputExporter, Outputs};
use workflow_orchestrator::io::local_path_for;
use workflow_orchestrator::runner::{Orchestrator, SessionArgsBuilder};
use workflow_orchestrator::storage::StorageRegistry;
use workflow_orchestrator::telemetry::init_tracing;
use workflow_orchestrator::tracking::Parameters;

#[derive(Parser, Clone)]
#[command(name = "wo", about = "Orchestration helper for ML pipeline steps")]
struct Args {
    /// Quiet mode - only warnings and errors are logged
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// AWS region for s3:// URIs (defaults to the provider chain)
    #[arg(long, global = true)]
    region: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Subcommand)]
enum Command {
    /// Upload a local file or directory to a storage URI
    Upload {
        source: PathBuf,
        destination: String,

        /// Transfer even when the remote md5 matches
        #[arg(long)]
        no_cache: bool,
    },

    /// Download an object or every object under a prefix
    Download {
        source: String,

        /// Local destination (defaults to the key of SOURCE)
        destination: Option<String>,

        /// Transfer even when the local md5 matches
        #[arg(long)]
        no_cache: bool,
    },

    /// List the objects under a prefix
    List { source: String },

    /// Check whether an object exists
    Exists { uri: String },

    /// Print the step configuration read from the config map mount
    Config {
        /// Only print this key
        key: Option<String>,

        #[arg(long, default_value = DEFAULT_MOUNT_PATH)]
        mount_path: PathBuf,

        /// Default value used when the mount does not provide the key (KEY=VALUE)
        #[arg(long = "default", value_parser = cli::parse_key_value)]
        defaults: Vec<(String, String)>,
    },

    /// Write outputs as files for the pipeline scheduler
    Export {
        /// Output as NAME=VALUE; VALUE is parsed as JSON and kept as text otherwise
        #[arg(long = "output", value_parser = cli::parse_key_value, required = true)]
        outputs: Vec<(String, String)>,

        /// Directory outputs are written to
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },

    /// Run a command inside an orchestrated session
    Run {
        /// Input to download before the command runs (SOURCE_URI=LOCAL_PATH)
        #[arg(long = "input", value_parser = cli::parse_input)]
        inputs: Vec<(String, String)>,

        /// Output to upload after the command succeeds (LOCAL_PATH=DESTINATION_URI)
        #[arg(long = "output", value_parser = cli::parse_output)]
        outputs: Vec<(String, String)>,

        /// Parameter reported to the tracker (KEY=VALUE)
        #[arg(long = "param", value_parser = cli::parse_key_value)]
        params: Vec<(String, String)>,

        /// Default config value (KEY=VALUE)
        #[arg(long = "default", value_parser = cli::parse_key_value)]
        defaults: Vec<(String, String)>,

        #[arg(long)]
        experiment: Option<String>,

        #[arg(long)]
        mount_path: Option<PathBuf>,

        /// File the command's output is written to and uploaded from
        #[arg(long)]
        logs_file: Option<PathBuf>,

        /// Bucket URI logs are uploaded under
        #[arg(long)]
        logs_bucket: Option<String>,

        #[arg(long)]
        logs_path: Option<String>,

        /// Report parameters to the MLflow server configured as `uri.mlflow`
        #[arg(long)]
        track: bool,

        /// Do not export outputs
        #[arg(long)]
        no_export: bool,

        #[arg(long)]
        no_cache: bool,

        /// Development run - logs stay local and outputs are exported to the working directory
        #[arg(long)]
        dry_run: bool,

        /// Command to run, after `--`
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let dry_run = matches!(args.command, Command::Run { dry_run: true, .. });
    let level = if args.quiet {
        "warn"
    } else if args.verbose || dry_run {
        "debug"
    } else {
        "info"
    };
    init_tracing(level);

    match args.command {
        Command::Upload {
            source,
            destination,
            no_cache,
        } => {
            let storage = StorageRegistry::from_env(args.region).await;
            if source.is_dir() {
                let stats = storage
                    .upload_prefix(&source, &destination, !no_cache)
                    .await?;
                println!(
                    "Uploaded {} files ({} bytes), {} unchanged",
                    stats.files_transferred, stats.bytes_transferred, stats.files_skipped
                );
            } else {
                let outcome = storage.upload_file(&source, &destination, !no_cache).await?;
                println!("{}", cli::describe(&outcome, &destination));
            }
        }
        Command::Download {
            source,
            destination,
            no_cache,
        } => {
            let storage = StorageRegistry::from_env(args.region).await;
            let target = local_path_for(destination.as_deref().unwrap_or(&source));
            if storage.object_exists(&source).await? {
                let outcome = storage.download_file(&source, &target, !no_cache).await?;
                println!("{}", cli::describe(&outcome, &target.display().to_string()));
            } else {
                let stats = storage.download_prefix(&source, &target, !no_cache).await?;
                println!(
                    "Downloaded {} files ({} bytes), {} unchanged",
                    stats.files_transferred, stats.bytes_transferred, stats.files_skipped
                );
            }
        }
        Command::List { source } => {
            let storage = StorageRegistry::from_env(args.region).await;
            let mut listing = storage.list_prefix(&source)?;
            while let Some(object) = listing.next().await {
                let object = object?;
                println!("{}\t{}", object.uri, object.relative_path);
            }
        }
        Command::Exists { uri } => {
            let storage = StorageRegistry::from_env(args.region).await;
            let exists = storage.object_exists(&uri).await?;
            println!("{exists}");
            if !exists {
                std::process::exit(1);
            }
        }
        Command::Config {
            key,
            mount_path,
            defaults,
        } => {
            let config = ConfigMap::read(&defaults.into_iter().collect(), &mount_path)?;
            match key {
                Some(key) => {
                    let value = config
                        .get(&key)
                        .with_context(|| format!("No config value for {key}"))?;
                    println!("{value}");
                }
                None => {
                    for (key, value) in &config {
                        println!("{key}={value}");
                    }
                }
            }
        }
        Command::Export { outputs, dir } => {
            let outputs: Outputs = outputs
                .into_iter()
                .map(|(name, value)| (name, cli::parse_output_value(&value)))
                .collect();
            for path in OutputExporter::in_dir(dir).export(&outputs).await? {
                println!("{}", path.display());
            }
        }
        Command::Run {
            inputs,
            outputs,
            params,
            defaults,
            experiment,
            mount_path,
            logs_file,
            logs_bucket,
            logs_path,
            track,
            no_export,
            no_cache,
            dry_run,
            command,
        } => {
            let mut builder = SessionArgsBuilder::default();
            builder
                .inputs(inputs)
                .outputs(
                    outputs
                        .into_iter()
                        .map(|(source, destination)| (PathBuf::from(source), destination))
                        .collect::<Vec<_>>(),
                )
                .default_params(defaults.into_iter().collect::<ConfigValues>())
                .use_tracking(track)
                .use_exporter(!no_export)
                .cache(!no_cache)
                .dry_run(dry_run);
            if let Some(experiment) = experiment {
                builder.experiment(experiment);
            }
            if let Some(mount_path) = mount_path {
                builder.mount_path(mount_path);
            }
            if let Some(logs_file) = &logs_file {
                builder.logs_file(logs_file.clone());
            }
            if let Some(logs_bucket) = logs_bucket {
                builder.logs_bucket(logs_bucket);
            }
            if let Some(logs_path) = logs_path {
                builder.logs_path(logs_path);
            }

            let storage = StorageRegistry::from_env(args.region).await;
            let orchestrator = Orchestrator::new(builder.build()?, storage).await?;
            let parameters: Parameters = params.into_iter().collect();

            let (code, summary) = orchestrator
                .run(|session| {
                    Box::pin(async move {
                        session.add_parameters(parameters);
                        let code = run_command(&command, logs_file.as_deref()).await?;
                        session.add_output("exit_code", code);
                        if code != 0 {
                            bail!("Command {:?} exited with status {}", command, code);
                        }
                        anyhow::Ok(code)
                    })
                })
                .await?;

            println!(
                "Command exited with status {code}: downloaded {} files, uploaded {} files",
                summary.downloaded.files_transferred, summary.uploaded.files_transferred
            );
            if let Some(logs_path) = summary.logs_path {
                println!("Logs uploaded to {logs_path}");
            }
        }
    }
    Ok(())
}

/// Run `command`, sending its output to `logs_file` when one is given
async fn run_command(command: &[String], logs_file: Option<&std::path::Path>) -> anyhow::Result<i32> {
    let Some((program, args)) = command.split_first() else {
        bail!("No command given");
    };

    let mut process = tokio::process::Command::new(program);
    process.args(args);
    if let Some(logs_file) = logs_file {
        let stdout = std::fs::File::create(logs_file)
            .with_context(|| format!("Failed to create log file {}", logs_file.display()))?;
        let stderr = stdout
            .try_clone()
            .context("Failed to share log file with stderr")?;
        process.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
    }

    let status = process
        .status()
        .await
        .with_context(|| format!("Failed to start {program}"))?;
    Ok(status.code().unwrap_or(-1))
}

/// CLI utility functions for parsing command-line arguments
mod cli {
    use serde_json::Value;
    use workflow_orchestrator::storage::TransferOutcome;

    /// Parse a `KEY=VALUE` pair; the value may itself contain `=`
    pub fn parse_key_value(s: &str) -> anyhow::Result<(String, String)> {
        let Some((key, value)) = s.split_once('=') else {
            return Err(anyhow::anyhow!(
                "Invalid pair '{}'. Expected format: KEY=VALUE",
                s
            ));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(anyhow::anyhow!("Key cannot be empty in '{}'", s));
        }
        Ok((key.to_string(), value.to_string()))
    }

    /// Parse an input `SOURCE_URI=LOCAL_PATH`.
    ///
    /// The local path is taken after the last `=`, so partitioned source URIs such as
    /// `s3://bucket/version=2/data` keep their `=`.
    pub fn parse_input(s: &str) -> anyhow::Result<(String, String)> {
        let Some((source, local)) = s.rsplit_once('=') else {
            return Err(anyhow::anyhow!(
                "Invalid input '{}'. Expected format: SOURCE_URI=LOCAL_PATH",
                s
            ));
        };
        if source.is_empty() || local.is_empty() {
            return Err(anyhow::anyhow!(
                "Input '{}' needs both a source URI and a local path",
                s
            ));
        }
        Ok((source.to_string(), local.to_string()))
    }

    /// Parse an output `LOCAL_PATH=DESTINATION_URI`.
    ///
    /// The split is made before the first `=s3://` or `=gs://`, so either side may
    /// contain `=`.
    pub fn parse_output(s: &str) -> anyhow::Result<(String, String)> {
        let split = ["=s3://", "=gs://"]
            .iter()
            .filter_map(|marker| s.find(marker))
            .min();
        let Some(split) = split else {
            return Err(anyhow::anyhow!(
                "Invalid output '{}'. Expected format: LOCAL_PATH=s3://... or LOCAL_PATH=gs://...",
                s
            ));
        };
        let (local, destination) = (&s[..split], &s[split + 1..]);
        if local.is_empty() {
            return Err(anyhow::anyhow!("Local path cannot be empty in '{}'", s));
        }
        Ok((local.to_string(), destination.to_string()))
    }

    /// Output values are JSON when they parse as JSON, text otherwise
    pub fn parse_output_value(value: &str) -> Value {
        serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()))
    }

    pub fn describe(outcome: &TransferOutcome, target: &str) -> String {
        match outcome {
            TransferOutcome::Transferred { bytes } => format!("Transferred {bytes} bytes to {target}"),
            TransferOutcome::Skipped => format!("{target} is up to date"),
        }
    }

}
