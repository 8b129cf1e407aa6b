use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

use split_checkpoint::config::{self, ConfigDoc, DEFAULT_CONFIG_FILE};
use split_checkpoint::logging::{self, LogFormat};
use split_checkpoint::process::supervise;
use split_checkpoint::{Checkpointer, Error, ErrorKind, Result};

#[derive(Debug, Parser)]
#[command(author, version, about = "Multi-volume checkpoint/restore of large build trees")]
struct Args {
    /// Path to the checkpoint configuration TOML
    #[arg(long, short = 'c', global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Override checkpoint.base_name from the config
    #[arg(long, global = true)]
    base_name: Option<String>,
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Archive paths into a new checkpoint, replacing the previous one
    Create {
        /// Paths relative to the working directory
        #[arg(required = true)]
        paths: Vec<String>,
        #[arg(long, short = 'C', default_value = ".")]
        working_dir: PathBuf,
    },
    /// Recreate the checkpointed tree under the working directory
    Restore {
        #[arg(long, short = 'C', default_value = ".")]
        working_dir: PathBuf,
    },
    /// Print the published manifest
    Show,
    /// Delete the checkpoint from the store
    Clean,
    /// Check that tar, the compressor, and the store tooling are installed
    Check,
    /// Print the fully-resolved config (after extends)
    Resolve,
    /// Run a command under a time budget, escalating SIGTERM to SIGKILL
    Run {
        /// Budget such as "5h30m", "90m" or plain seconds
        #[arg(long, value_parser = config::parse_duration)]
        budget: std::time::Duration,
        #[arg(long, value_parser = config::parse_duration, default_value = "30s")]
        grace: std::time::Duration,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

fn exit_code_for(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Other => 1,
        ErrorKind::Config => 2,
        ErrorKind::Transfer => 3,
        ErrorKind::NotFound => 4,
        ErrorKind::ArchiveTool => 5,
        ErrorKind::ManifestCorrupt => 6,
        ErrorKind::Precondition => 7,
    }
}

fn main() {
    let _ = dotenv::dotenv();
    let args = Args::parse();
    if let Err(e) = logging::init("info", args.log_format) {
        eprintln!("{e}");
    }

    match dispatch(args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(kind = e.kind().as_str(), "{e}");
            eprintln!("error: {e}");
            std::process::exit(exit_code_for(e.kind()));
        }
    }
}

fn dispatch(args: Args) -> Result<i32> {
    match args.cmd {
        Command::Run {
            budget,
            grace,
            command,
        } => cmd_run(&command, budget, grace),
        Command::Create { paths, working_dir } => {
            let ck = checkpointer(&args.config, args.base_name.as_deref())?;
            let manifest = ck.create_checkpoint(&paths, &working_dir)?;
            println!(
                "created checkpoint '{}' with {} volume(s)",
                manifest.base_name, manifest.volume_count
            );
            Ok(0)
        }
        Command::Restore { working_dir } => {
            let ck = checkpointer(&args.config, args.base_name.as_deref())?;
            let manifest = ck.restore_checkpoint(&working_dir)?;
            println!(
                "restored checkpoint '{}' ({} volume(s), created {})",
                manifest.base_name, manifest.volume_count, manifest.created_at
            );
            Ok(0)
        }
        Command::Show => {
            let ck = checkpointer(&args.config, args.base_name.as_deref())?;
            let manifest = ck.load_manifest()?;
            println!("{}", manifest.to_json()?);
            Ok(0)
        }
        Command::Clean => {
            let ck = checkpointer(&args.config, args.base_name.as_deref())?;
            ck.discard_checkpoint();
            Ok(0)
        }
        Command::Check => {
            let ck = checkpointer(&args.config, args.base_name.as_deref())?;
            ck.preflight()?;
            let cfg = ck.config();
            println!(
                "ok: '{}' in {} ({} volumes)",
                ck.base_name(),
                ck.store().describe(),
                cfg.volume_size
            );
            Ok(0)
        }
        Command::Resolve => {
            let doc = load_doc(&args.config, args.base_name.as_deref())?;
            // Best-effort pretty print of resolved config.
            let s = toml::to_string_pretty(&doc.value).unwrap_or_else(|_| format!("{:?}", doc.value));
            print!("{s}");
            Ok(0)
        }
    }
}

fn load_doc(path: &Path, base_name: Option<&str>) -> Result<ConfigDoc> {
    let mut doc = config::load(path)?;
    if let Some(name) = base_name {
        let Some(root) = doc.value.as_table_mut() else {
            return Err(Error::config(format!("{} is not a TOML table", path.display())));
        };
        if !root.contains_key("checkpoint") {
            root.insert("checkpoint".into(), toml::Value::Table(Default::default()));
        }
        let Some(section) = root.get_mut("checkpoint").and_then(|v| v.as_table_mut()) else {
            return Err(Error::config("'checkpoint' must be a table"));
        };
        section.insert("base_name".into(), toml::Value::String(name.to_string()));
    }
    Ok(doc)
}

fn checkpointer(path: &Path, base_name: Option<&str>) -> Result<Checkpointer> {
    let doc = load_doc(path, base_name)?;
    Checkpointer::from_config(&doc)
}

fn cmd_run(command: &[String], budget: std::time::Duration, grace: std::time::Duration) -> Result<i32> {
    let Some((program, rest)) = command.split_first() else {
        return Err(Error::config("no command given"));
    };
    let mut cmd = ProcessCommand::new(program);
    cmd.args(rest);
    let exit = supervise(cmd, budget, grace)?;
    if exit.timed_out {
        tracing::warn!(
            program = %program,
            forced = exit.forced,
            "command stopped at its time budget"
        );
    }
    Ok(exit.reported_code())
}
