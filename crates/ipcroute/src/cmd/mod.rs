use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};
use ipcroute_transport::{Transport, UdsTransport};

use crate::exit::{transport_error, CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod serve;
pub mod subscribe;
pub mod version;

/// Settings shared by every subcommand.
pub struct Context {
    pub runtime_dir: PathBuf,
    pub format: OutputFormat,
}

impl Context {
    pub fn transport(&self) -> CliResult<Arc<dyn Transport>> {
        let transport = UdsTransport::new(&self.runtime_dir)
            .map_err(|err| transport_error("runtime directory unavailable", err))?;
        Ok(Arc::new(transport))
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Host a demo service with echo, exit, uptime and tick routes.
    Serve(ServeArgs),
    /// Send one request and print the response.
    Call(CallArgs),
    /// Subscribe to a command and print its notifications.
    Subscribe(SubscribeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, context: &Context) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, context),
        Command::Call(args) => call::run(args, context),
        Command::Subscribe(args) => subscribe::run(args, context),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Service (and channel) name to listen on.
    pub name: String,
    /// Interval between `<name>/tick` notifications (e.g. 1s, 250ms).
    #[arg(long, default_value = "1s")]
    pub tick_interval: String,
    /// Refuse peers running as a different user.
    #[arg(long)]
    pub same_user: bool,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Service to connect to.
    pub service: String,
    /// Method to call, e.g. `Clock/now`.
    pub method: String,
    /// JSON params.
    #[arg(long)]
    pub params: Option<String>,
    /// Maximum time to wait for the response (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct SubscribeArgs {
    /// Service to connect to.
    pub service: String,
    /// Command to subscribe to, e.g. `Clock/tick`.
    pub command: String,
    /// Exit after receiving N notifications.
    #[arg(long)]
    pub count: Option<usize>,
    /// Connection timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

pub(crate) fn parse_params(params: Option<&str>) -> CliResult<Option<serde_json::Value>> {
    params
        .map(|text| {
            serde_json::from_str(text)
                .map_err(|err| CliError::new(USAGE, format!("--params is not valid JSON: {err}")))
        })
        .transpose()
}

/// Flag cleared on Ctrl-C.
pub(crate) fn install_ctrlc_handler() -> CliResult<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst)).map_err(|err| {
        CliError::new(INTERNAL, format!("signal handler setup failed: {err}"))
    })?;
    Ok(running)
}
