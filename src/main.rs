use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use tracing::{error, info};

use vsock_relay::config::load_config;
use vsock_relay::io_thread::IoThreadPool;
use vsock_relay::listener::Listener;
use vsock_relay::metrics;
use vsock_relay::poller::EpollPollerFactory;

#[derive(Parser)]
#[command(
    name = "vsock-relay",
    version,
    about = "Relay byte streams between AF_VSOCK and TCP/IPv4 endpoints"
)]
struct Args {
    /// Path to the service configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Detach from the terminal and run in the background
    #[arg(short, long)]
    daemon: bool,

    /// Number of I/O threads
    #[arg(long, default_value_t = NonZeroUsize::new(1).unwrap())]
    io_threads: NonZeroUsize,

    /// Minimum severity to log: trace, debug, info, warn or error
    #[arg(long, default_value_t = tracing::Level::INFO)]
    log_level: tracing::Level,

    /// Write logs to this file instead of stderr; with --daemon and no log
    /// file, log output is discarded
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();

    // a closed bridged connection must surface as a write error, not kill us
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    if args.daemon {
        if let Err(e) = daemonize() {
            eprintln!("vsock-relay: failed to daemonize: {e}");
            process::exit(1);
        }
    }

    init_logging(&args);

    let services = match load_config(&args.config) {
        Ok(services) => services,
        Err(e) => {
            error!(config = %args.config.display(), error = %e, "failed to load configuration");
            process::exit(1);
        }
    };

    let pool = match IoThreadPool::new(args.io_threads.get(), &EpollPollerFactory) {
        Ok(pool) => Arc::new(pool),
        Err(e) => {
            error!(error = %e, "failed to start io threads");
            process::exit(1);
        }
    };
    info!(io_threads = pool.size(), services = services.len(), "starting");

    let mut handles = Vec::with_capacity(services.len());
    for service in services {
        let listener = match Listener::bind(&service, Arc::clone(&pool)) {
            Ok(listener) => listener,
            Err(e) => {
                error!(service = %service.name, error = %e, "failed to start listener");
                process::exit(1);
            }
        };
        let handle = thread::Builder::new()
            .name(format!("listen-{}", service.name))
            .spawn(move || listener.run())
            .expect("failed to spawn listener thread");
        handles.push(handle);
    }

    metrics::spawn_reporter();

    for handle in handles {
        let _ = handle.join();
    }
}

fn init_logging(args: &Args) {
    let builder = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_writer(io::stderr);

    match &args.log_file {
        Some(path) => {
            let file = File::create(path).unwrap_or_else(|e| {
                eprintln!("vsock-relay: cannot open log file {}: {e}", path.display());
                process::exit(1);
            });
            builder.with_ansi(false).with_writer(Arc::new(file)).init();
        }
        None => builder.init(),
    }
}

/// Classic double-dissociation: fork so the parent can exit, start a new
/// session, clear the umask and drop the stdio descriptors.
fn daemonize() -> io::Result<()> {
    unsafe {
        let pid = libc::fork();
        if pid < 0 {
            return Err(io::Error::last_os_error());
        }
        if pid > 0 {
            process::exit(0);
        }

        libc::umask(0);

        if libc::setsid() < 0 {
            return Err(io::Error::last_os_error());
        }

        libc::close(libc::STDIN_FILENO);
        libc::close(libc::STDOUT_FILENO);
        libc::close(libc::STDERR_FILENO);
    }
    Ok(())
}
