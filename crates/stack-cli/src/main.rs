mod root;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use stack_core::{Runtime, Settings, Unit};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "stack",
    about = "Run a tree of declarative stacks: vars, conditions, templates and scripts",
    version
)]
struct Cli {
    /// Directory holding the root stack file (default: current directory)
    #[arg(short = 'w', long, env = "STACK_WORKDIR")]
    workdir: Option<PathBuf>,

    /// Extra vars files merged into the root stack, in order
    #[arg(short = 'f', long = "file", value_name = "FILE")]
    files: Vec<PathBuf>,

    /// Override vars: key.path=value[,key=value]
    #[arg(short = 's', long = "set", value_name = "KEY=VALUE")]
    set: Vec<String>,

    /// More output (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log line format
    #[arg(short = 'l', long, value_enum, default_value_t = LogFormat::Fmt)]
    log_format: LogFormat,

    /// Where git libraries are checked out, relative to the workdir
    #[arg(long, default_value = stack_core::paths::DEFAULT_GITLIBS_DIR)]
    gitlibs_path: PathBuf,

    /// Default timeout for waits and actions (e.g. 30s, 10m)
    #[arg(long, default_value = "10m", value_parser = humantime::parse_duration)]
    wait_timeout: Duration,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Fmt,
    Json,
}

fn init_tracing(verbose: u8, format: LogFormat) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Fmt => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let root = root::resolve_root(cli.workdir.as_deref());
    let mut settings = Settings::new(&root);
    settings.var_files = cli.files;
    settings.set_values = cli.set;
    settings.gitlibs_dir = stack_core::paths::absolutize(&root, &cli.gitlibs_path);
    settings.default_timeout = cli.wait_timeout;

    let rt = Runtime::new(settings);
    {
        let rt = rt.clone();
        ctrlc::set_handler(move || {
            tracing::warn!("interrupted, cancelling");
            rt.interrupt();
        })
        .context("failed to install interrupt handler")?;
    }

    let unit = Unit::load_root(&rt)?;
    unit.start()?;
    Ok(rt.exit_code())
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}
