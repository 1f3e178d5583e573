//! Command-line front-end: run a script through a backend, or talk to it as
//! a shell. This is the smallest useful consumer of the proxy; graphical
//! front-ends sit on the same API.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use eyre::WrapErr;
use tracing_subscriber::EnvFilter;

use debugger::BackendProxy;
use server::LaunchOptions;
use transport::commands::{CommandToBackend, ToplevelCommand};
use transport::events::{BackendEvent, MessageFromBackend, StreamName};
use transport::responses::ToplevelResponse;

const POLL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "wirebug", about = "Run programs on a wirebug backend")]
struct Args {
    /// Script to run; without it an interactive shell starts.
    script: Option<PathBuf>,
    /// Launch-configuration file (JSONC).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Configuration name inside the config file.
    #[arg(long, default_value = "local")]
    backend: String,
    /// Backend executable, overriding any configuration.
    #[arg(long)]
    executable: Option<PathBuf>,
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let options = resolve_options(&args)?;
    let proxy = BackendProxy::launch(options).wrap_err("starting backend")?;

    // Ctrl-C interrupts the program, not this front-end
    let interrupt_proxy = proxy.clone();
    ctrlc::set_handler(move || {
        let _ = interrupt_proxy.interrupt();
    })
    .wrap_err("installing Ctrl-C handler")?;

    let ready = wait_for_toplevel(&proxy)?;
    if let Some(welcome) = &ready.welcome_text {
        eprintln!("{welcome}");
    }

    match &args.script {
        Some(script) => run_script(&proxy, script),
        None => shell_loop(&proxy),
    }
}

fn resolve_options(args: &Args) -> eyre::Result<LaunchOptions> {
    if let Some(executable) = &args.executable {
        return Ok(LaunchOptions::Local {
            executable: executable.clone(),
            args: Vec::new(),
            cwd: None,
            env: Default::default(),
        });
    }
    if let Some(config_path) = &args.config {
        let configuration = launch_configuration::load_from_path(&args.backend, config_path)?
            .ok_or_else(|| {
                eyre::eyre!(
                    "no configuration named {:?} in {}",
                    args.backend,
                    config_path.display()
                )
            })?;
        return Ok(configuration.to_launch_options());
    }
    Ok(LaunchOptions::Local {
        executable: launch_configuration::DEFAULT_BACKEND_COMMAND.into(),
        args: Vec::new(),
        cwd: None,
        env: Default::default(),
    })
}

fn run_script(proxy: &BackendProxy, script: &std::path::Path) -> eyre::Result<()> {
    proxy.send_command(CommandToBackend::Toplevel(
        ToplevelCommand::new("Run").with_args([script.display().to_string()]),
    ))?;

    // Run restarts the backend, so a fresh ready message precedes the result
    let _ready = wait_for_toplevel(proxy)?;
    let response = wait_for_toplevel(proxy)?;
    print_failure(&response);
    std::process::exit(if response.user_exception.is_some() { 1 } else { 0 });
}

fn shell_loop(proxy: &BackendProxy) -> eyre::Result<()> {
    let stdin = std::io::stdin();
    loop {
        print!(">>> ");
        std::io::stdout().flush().ok();

        let mut line = String::new();
        if stdin.read_line(&mut line).wrap_err("reading input")? == 0 {
            return Ok(()); // EOF ends the session
        }
        if line.trim().is_empty() {
            continue;
        }

        proxy.send_command(CommandToBackend::Toplevel(
            ToplevelCommand::new("execute_source").with_source(line),
        ))?;

        let response = wait_for_toplevel(proxy)?;
        print_failure(&response);
        // like an interactive interpreter, a bare None result stays quiet
        if let Some(value) = &response.value_info {
            if value.repr != "None" {
                println!("{}", value.repr);
            }
        }
    }
}

/// Drains the message stream, relaying output and stdin requests, until the
/// next toplevel response.
fn wait_for_toplevel(proxy: &BackendProxy) -> eyre::Result<ToplevelResponse> {
    loop {
        let message = match proxy.fetch_next_message(POLL) {
            Ok(Some(message)) => message,
            Ok(None) => {
                if proxy.state().is_disconnected() {
                    eyre::bail!("backend disconnected");
                }
                continue;
            }
            Err(e) => {
                eyre::bail!("connection lost: {e}");
            }
        };

        match message {
            MessageFromBackend::Toplevel(response) => return Ok(response),
            MessageFromBackend::Event(BackendEvent::ProgramOutput { stream_name, data }) => {
                match stream_name {
                    StreamName::Stdout => {
                        print!("{data}");
                        std::io::stdout().flush().ok();
                    }
                    StreamName::Stderr => {
                        eprint!("{data}");
                    }
                }
            }
            MessageFromBackend::Event(BackendEvent::InputRequest { .. }) => {
                let mut line = String::new();
                if std::io::stdin().read_line(&mut line).unwrap_or(0) == 0 {
                    line.clear(); // EOF: submit an empty line
                }
                proxy.send_program_input(line)?;
            }
            MessageFromBackend::Event(BackendEvent::InlineProgress { .. }) => {}
            MessageFromBackend::Inline(_) | MessageFromBackend::Debugger(_) => {
                // this front-end never issues inline or debugger commands
                tracing::debug!("ignoring message this front-end did not ask for");
            }
        }
    }
}

fn print_failure(response: &ToplevelResponse) {
    if let Some(error) = &response.error {
        eprintln!("{error}");
    }
    if let Some(exception) = &response.user_exception {
        for item in &exception.items {
            eprint!("{}", item.text);
        }
    }
}
