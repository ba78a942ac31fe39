//! Command-line front-end for the sandbox launcher.

use crate::detect;
use crate::launcher;
use crate::policy;
use crate::types::IsolateError;
use clap::{CommandFactory, Parser};
use log::warn;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "isolate",
    version,
    about = "Run a native binary inside a daemonless sandbox driven by a capability file",
    disable_help_flag = true
)]
struct Cli {
    /// Capability file (default: <binary>.caps)
    #[arg(short = 'c', value_name = "FILE")]
    caps_file: Option<PathBuf>,

    /// Detect capabilities and write a draft file instead of running
    #[arg(short = 'd')]
    detect: bool,

    /// Output capability file (with -d)
    #[arg(short = 'o', value_name = "FILE")]
    output: Option<PathBuf>,

    /// Verbose output
    #[arg(short = 'v')]
    verbose: bool,

    /// Dry run: print the resolved policy, do not provision
    #[arg(short = 'n')]
    dry_run: bool,

    /// Show usage and exit
    #[arg(short = 'h', long = "help")]
    help: bool,

    /// Target binary and its arguments
    #[arg(value_name = "BINARY", trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

/// Entry point for the `isolate` binary; returns the process exit code.
pub fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();

    let mut builder = env_logger::Builder::new();
    builder.filter_level(if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    });
    builder.parse_default_env();
    builder.try_init()?;

    if cli.help {
        print_usage();
        return Ok(1);
    }

    let Some((target, args)) = cli.command.split_first() else {
        eprintln!("isolate: no target binary specified");
        print_usage();
        return Ok(1);
    };
    let target = PathBuf::from(target);

    if cli.detect {
        if cli.dry_run {
            eprintln!("isolate: -n (dry run) cannot be combined with -d (detect)");
            return Ok(1);
        }
        return match detect::detect_capabilities(&target, cli.output.as_deref()) {
            Ok(output) => {
                println!("Generated capability file: {}", output.display());
                println!("Review it, then run: isolate {}", target.display());
                Ok(0)
            }
            Err(err) => {
                report(&err);
                Ok(1)
            }
        };
    }

    if cli.output.is_some() {
        eprintln!("isolate: -o can only be used with -d (detect mode)");
        return Ok(1);
    }

    let (caps_path, explicit) = match cli.caps_file {
        Some(path) => (path, true),
        None => {
            let mut path = target.as_os_str().to_owned();
            path.push(".caps");
            (PathBuf::from(path), false)
        }
    };

    if !explicit && !caps_path.exists() {
        warn!(
            "generate a capability file with: isolate -d {}",
            target.display()
        );
    }

    let policy = match policy::load(&caps_path, explicit) {
        Ok(policy) => policy,
        Err(err) => {
            report(&err);
            return Ok(1);
        }
    };

    if cli.verbose {
        println!("Target binary: {}", target.display());
        println!("Capability file: {}", caps_path.display());
        print!("{}", policy.describe());
    }

    if cli.dry_run {
        if !cli.verbose {
            print!("{}", policy.describe());
        }
        let mut command = target.display().to_string();
        for arg in args {
            command.push(' ');
            command.push_str(arg);
        }
        println!("Dry run - would execute inside the sandbox: {}", command);
        return Ok(0);
    }

    match launcher::launch(&policy, &target, args) {
        Ok(code) => Ok(code),
        Err(err) => {
            report(&err);
            Ok(1)
        }
    }
}

/// Exactly one principal diagnostic per fatal error, with the
/// actionable suggestion when the class has one.
fn report(err: &IsolateError) {
    match err.suggestion() {
        Some(suggestion) => eprintln!("isolate: {}: {} ({})", err.kind(), err, suggestion),
        None => eprintln!("isolate: {}: {}", err.kind(), err),
    }
}

fn print_usage() {
    let mut command = Cli::command();
    let _ = command.print_help();
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  isolate -d ./myapp             generate a draft capability file");
    eprintln!("  doas isolate ./myapp           run under ./myapp.caps");
    eprintln!("  doas isolate -c custom.caps ./myapp arg1 arg2");
}
