//! gargs CLI entry point.
//!
//! Reads records from stdin, fills the command template, and fans the
//! commands out across a worker pool:
//!
//! ```text
//!   cat hosts.txt | gargs -p 8 "ssh {} uptime"
//!   seq 12 -1 1  | gargs -p 4 -o "sleep {}; echo {}"
//!   cat pairs.txt | gargs -s '\s+' "scp {0}:{1} ."
//! ```
//!
//! Captured stdout of every command is streamed to our stdout without
//! interleaving; child stderr passes straight through. The exit code is the
//! highest exit code seen across all commands.

mod records;
mod template;

use std::io::{self, BufWriter, Write};
use std::process::ExitCode;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gargs_process::{run_commands, Options};
use template::Template;

/// Run a templated shell command for every record on stdin.
#[derive(Debug, Parser)]
#[command(name = "gargs", version, about)]
struct Args {
    /// Number of concurrent processes.
    #[arg(short = 'p', long = "procs", default_value_t = 1)]
    procs: usize,

    /// Lines consumed per command. Mutually exclusive with --sep.
    #[arg(short = 'n', long = "nlines", default_value_t = 1)]
    nlines: usize,

    /// Regular expression splitting each line into `{N}` tokens.
    #[arg(short = 's', long = "sep")]
    sep: Option<String>,

    /// Extra attempts for commands that exit non-zero.
    #[arg(short = 'r', long = "retries", default_value_t = 0)]
    retries: u32,

    /// Emit output in submission order instead of completion order.
    #[arg(short = 'o', long = "ordered")]
    ordered: bool,

    /// Print the generated commands without running them.
    #[arg(short = 'd', long = "dry-run")]
    dry_run: bool,

    /// Echo each command to stderr before it runs.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Report failing commands but keep executing the rest.
    #[arg(short = 'c', long = "continue-on-error")]
    continue_on_error: bool,

    /// Command template: `{}` is the record, `{N}` its N-th token.
    #[arg(value_name = "COMMAND")]
    command: String,
}

fn main() -> ExitCode {
    // Respects RUST_LOG, as elsewhere in the workspace.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("gargs: {e:#}");
            ExitCode::from(255)
        }
    }
}

fn run() -> Result<ExitCode> {
    let args = Args::parse();
    if args.sep.is_some() && args.nlines > 1 {
        anyhow::bail!("--sep and --nlines are mutually exclusive");
    }
    let sep = args
        .sep
        .as_deref()
        .map(Regex::new)
        .transpose()
        .context("invalid --sep pattern")?;
    let template = Template::parse(&args.command);

    let rt = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    rt.block_on(drive(args, template, sep))
}

async fn drive(args: Args, template: Template, sep: Option<Regex>) -> Result<ExitCode> {
    let (cmd_tx, cmd_rx) = mpsc::channel::<String>(args.procs.max(1));

    // Bad records (template token out of range) are reported and skipped;
    // they surface in the exit code.
    let record_exit = Arc::new(AtomicI32::new(0));

    // stdin is consumed with blocking reads off the async runtime.
    let reader = {
        let record_exit = record_exit.clone();
        let nlines = args.nlines;
        let verbose = args.verbose;
        let dry_run = args.dry_run;
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let stdin = io::stdin();
            records::read_records(stdin.lock(), nlines, sep.as_ref(), |record| {
                match template.fill(&record.lines, &record.tokens) {
                    Ok(command) => {
                        if verbose {
                            eprintln!("command: {command}");
                        }
                        if dry_run {
                            println!("{command}");
                            true
                        } else {
                            cmd_tx.blocking_send(command).is_ok()
                        }
                    }
                    Err(e) => {
                        eprintln!("gargs: {e}");
                        record_exit.fetch_max(1, Ordering::SeqCst);
                        true
                    }
                }
            })
        })
    };

    if args.dry_run {
        reader.await.context("record reader panicked")??;
        return Ok(exit_code(record_exit.load(Ordering::SeqCst)));
    }

    let opts = Options {
        retries: args.retries,
        ordered: args.ordered,
        workers: args.procs.max(1),
        ..Options::default()
    };
    let cancel = CancellationToken::new();
    let mut handles = run_commands(cmd_rx, cancel.clone(), opts);

    let mut max_exit = 0i32;
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    while let Some(mut cmd) = handles.recv().await {
        let code = cmd.exit_code();
        if code != 0 {
            eprintln!("gargs: {cmd}");
            if !args.continue_on_error {
                // Stop feeding and emitting; in-flight children finish on
                // their own.
                cancel.cancel();
                out.flush().ok();
                return Ok(exit_code(code));
            }
            max_exit = max_exit.max(code);
        }
        io::copy(&mut cmd, &mut out).context("failed to write command output")?;
        cmd.cleanup();
    }
    out.flush().context("failed to flush stdout")?;

    reader.await.context("record reader panicked")??;
    max_exit = max_exit.max(record_exit.load(Ordering::SeqCst));
    Ok(exit_code(max_exit))
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(code.clamp(0, 255) as u8)
}
