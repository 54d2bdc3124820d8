use managed_login::platform;

/// Initialize logging
///
/// `RUST_LOG` wins over `--verbose`, which wins over the configured level.
pub fn init_logging(verbose: bool, configured_level: Option<&str>) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let level = if verbose {
        "debug"
    } else {
        configured_level.unwrap_or("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

/// Exit unless running as root
pub fn require_admin_privileges() {
    if let Err(e) = platform::ensure_admin_privileges() {
        eprintln!("Insufficient privileges: {:#}", e);
        print_sudo_message();
        std::process::exit(1);
    }
}

pub fn print_sudo_message() {
    let program = std::env::args()
        .next()
        .unwrap_or_else(|| "managed-login".to_string());
    eprintln!("Please run with sudo: sudo {}", program);
}
