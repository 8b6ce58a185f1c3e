use anyhow::Context;
use clap::Parser;
use otip_rproxy::{pidfile::PidFile, stack::LinuxNetlinkStackFactory};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() -> std::process::ExitCode {
    let cli = otip_rproxy::config::Cli::parse();

    let config = match otip_rproxy::config::resolve(cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("otip-rproxy: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    init_tracing(config.verbose);

    if let Err(e) = run(config) {
        tracing::error!(error = ?e, "fatal error");
        return std::process::ExitCode::FAILURE;
    }

    std::process::ExitCode::SUCCESS
}

fn init_tracing(verbose: bool) {
    let default_directive = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(config: otip_rproxy::config::Config) -> anyhow::Result<()> {
    if config.daemon {
        daemonize().context("failed to daemonize")?;
    }

    install_signal_handlers();

    let _pidfile = match &config.pidfile {
        Some(path) => Some(PidFile::create(path).with_context(|| format!("failed to create pidfile {}", path.display()))?),
        None => None,
    };

    let factory: Arc<dyn otip_rproxy::stack::StackFactory> =
        Arc::new(LinuxNetlinkStackFactory::new().context("failed to initialise netlink stack factory")?);

    otip_rproxy::run(config, factory)
}

/// Double-fork + `setsid`, matching glibc `daemon(0, 0)`'s effect on the
/// process's session/controlling-terminal attachment. Unlike `daemon(3)`
/// we deliberately leave stdio untouched so `tracing`'s stderr output
/// keeps reaching the service supervisor's log capture — see DESIGN.md.
fn daemonize() -> std::io::Result<()> {
    // SAFETY: `fork`/`setsid`/`chdir` are async-signal-safe calls made
    // before any threads exist in the child; no Rust state is shared
    // across the fork boundary here.
    unsafe {
        match libc::fork() {
            -1 => return Err(std::io::Error::last_os_error()),
            0 => {}
            _ => std::process::exit(0),
        }

        if libc::setsid() == -1 {
            return Err(std::io::Error::last_os_error());
        }

        match libc::fork() {
            -1 => return Err(std::io::Error::last_os_error()),
            0 => {}
            _ => std::process::exit(0),
        }

        let root = std::ffi::CString::new("/").expect("no interior NUL");
        libc::chdir(root.as_ptr());
    }
    Ok(())
}

extern "C" fn handle_terminate(_signum: libc::c_int) {
    std::process::exit(0);
}

/// Installs immediate-exit handlers for `SIGINT`/`SIGTERM`, matching the
/// original's `sigaction`-based shutdown: no connection draining, no
/// graceful teardown, just `exit(0)` (`spec.md` §5 "Cancellation").
fn install_signal_handlers() {
    // SAFETY: `handle_terminate` only calls `std::process::exit`, which is
    // documented as safe to call from a signal handler in practice on the
    // platforms we target (it does not allocate or take locks we hold).
    let handler: extern "C" fn(libc::c_int) = handle_terminate;
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}
