mod connect;
mod context;
mod errors;
mod logging;
mod menu;
mod nmcli;
mod prompt;
mod scan;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use context::AppContext;
use menu::Menu;
use nmcli::Nmcli;
use prompt::TtyPrompt;

/// Extra wall-clock slack given to captured tool calls on top of the
/// daemon-side activation timeout.
const HARD_TIMEOUT_SLACK: u64 = 10;

/// Set by the SIGINT handler; the menu loop treats it as quit, so scoped
/// cleanup (echo restoration, transient profiles) still runs.
pub static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: nix::libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Scan for wireless networks and connect through NetworkManager.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Wireless interface to drive (default: first wifi device)
    #[arg(short = 'i', long = "interface")]
    interface: Option<String>,

    /// Seconds to wait for each connection attempt
    #[arg(short = 'w', long = "wait", default_value = "15")]
    wait: u64,

    /// Log at debug level
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn install_interrupt_handler() -> Result<()> {
    // No SA_RESTART: a read blocked on the terminal must come back with
    // EINTR so the loop can wind down instead of hanging. Terminal input
    // goes through raw reads (prompt.rs) that surface EINTR rather than
    // the std buffered readers, which retry it.
    let action = SigAction::new(SigHandler::Handler(on_sigint), SaFlags::empty(), SigSet::empty());
    unsafe { signal::sigaction(Signal::SIGINT, &action) }
        .context("failed to install SIGINT handler")?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::setup_logging(cli.verbose)?;
    install_interrupt_handler()?;

    let tool = Nmcli::new(Duration::from_secs(cli.wait + HARD_TIMEOUT_SLACK));
    // Startup failures abort with a non-zero exit before the loop begins.
    let ctx = AppContext::build(&tool, cli.interface, cli.wait).context("startup failed")?;

    let mut tty = TtyPrompt::open()?;
    info!("interactive session starting on {}", ctx.interface);
    Menu::new(&tool, &ctx, &mut tty).run()
}
