//! The backend process entry point.
//!
//! Talks the wire protocol on stdin/stdout; stdout is reserved for protocol
//! messages, so logging goes to a per-user file (or wherever `--log-file`
//! points). A SIGINT from the controller lands in the same interrupt flag as
//! the wire-level immediate command.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use transport::Connection;

use backend::Backend;

#[derive(Parser)]
#[command(name = "wirebug-backend", about = "Process-separated execution backend")]
struct Args {
    /// Working directory to start in.
    #[arg(long)]
    cwd: Option<PathBuf>,
    /// Log file path; defaults to the user cache directory.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();
    init_logging(args.log_file.as_deref());

    if let Some(cwd) = &args.cwd {
        if let Err(e) = std::env::set_current_dir(cwd) {
            // not fatal: the controller learns the real cwd from the ready
            // message
            tracing::warn!(cwd = %cwd.display(), error = %e, "could not change directory");
        }
    }

    let interrupt = Arc::new(AtomicBool::new(false));
    install_interrupt_handler(&interrupt);

    let connection = Connection::new(Box::new(std::io::stdin()), Box::new(std::io::stdout()));
    let code = Backend::new(connection, interrupt).run();
    tracing::info!(code, "backend exiting");
    std::process::exit(code);
}

fn init_logging(log_file: Option<&std::path::Path>) {
    let path = log_file.map(PathBuf::from).unwrap_or_else(|| {
        let dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("wirebug");
        let _ = std::fs::create_dir_all(&dir);
        dir.join("backend.log")
    });

    match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_writer(std::sync::Arc::new(file))
                .with_ansi(false)
                .try_init();
        }
        Err(_) => {
            // last resort: stderr is visible in the controller's log pane
            let _ = tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
}

#[cfg(unix)]
fn install_interrupt_handler(interrupt: &Arc<AtomicBool>) {
    if let Err(e) = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(interrupt))
    {
        tracing::warn!(error = %e, "could not install SIGINT handler");
    }
}

#[cfg(not(unix))]
fn install_interrupt_handler(_interrupt: &Arc<AtomicBool>) {}
