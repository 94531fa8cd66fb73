use std::path::PathBuf;

use crate::config::{AppConfig, DEFAULT_CONFIG_PATH};
use crate::error::Result;
use crate::workers;

const NAME: &str = "origin_server";
const VERSION: &str = env!("CARGO_PKG_VERSION");

struct CliArgs {
    command: Option<String>,
    config_path: PathBuf,
    foreground: bool,
    help: bool,
    version: bool,
    status: bool,
}

fn parse_args(args: &[String]) -> CliArgs {
    let mut parsed = CliArgs {
        command: None,
        config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
        foreground: false,
        help: false,
        version: false,
        status: false,
    };
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                if i + 1 < args.len() {
                    parsed.config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "-f" | "--foreground" => parsed.foreground = true,
            "-h" | "--help" => parsed.help = true,
            "-v" | "--version" => parsed.version = true,
            "-s" | "--status" => parsed.status = true,
            other => {
                if parsed.command.is_none() {
                    parsed.command = Some(other.to_string());
                }
            }
        }
        i += 1;
    }
    parsed
}

fn print_usage() {
    println!("Usage: {} [run | kill | restart] [OPTIONS]", NAME);
    println!();
    println!("Options:");
    println!("  -c <file>, --config <file>   Config file (default: {})", DEFAULT_CONFIG_PATH);
    println!("  -f, --foreground             Run the server in the foreground");
    println!("  -s, --status                 Show whether the server is running");
    println!("  -h, --help                   Show this help message");
    println!("  -v, --version                Show version");
}

/// Entry point behind `main`; returns the process exit code.
pub fn run(args: &[String]) -> i32 {
    let parsed = parse_args(args);

    if parsed.help {
        print_usage();
        return 0;
    }
    if parsed.version {
        println!("{} version {}", NAME, VERSION);
        return 0;
    }

    let config = match AppConfig::load(&parsed.config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };

    if parsed.status {
        display_status(&config);
        return 0;
    }

    let Some(command) = parsed.command else {
        print_usage();
        return 1;
    };

    match command.as_str() {
        "run" => {
            if is_running(&config) {
                eprintln!("Server is already running.");
                return 1;
            }
            start_server(config, parsed.foreground)
        }
        "kill" => {
            if !is_running(&config) {
                eprintln!("Server is not running.");
                return 1;
            }
            match kill_server(&config) {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("{}", e);
                    1
                }
            }
        }
        "restart" => {
            if is_running(&config) {
                if let Err(e) = kill_server(&config) {
                    eprintln!("{}", e);
                    return 1;
                }
                std::thread::sleep(std::time::Duration::from_secs(1));
            }
            start_server(config, parsed.foreground)
        }
        other => {
            eprintln!("Unknown command '{}'", other);
            print_usage();
            1
        }
    }
}

fn start_server(config: AppConfig, foreground: bool) -> i32 {
    if !foreground {
        daemonise();
    }
    // After daemonising the pid has changed, so the pid file is written by
    // the process that will actually run the master loop.
    if let Err(e) = write_pid_file(&config) {
        eprintln!("{}", e);
        return 1;
    }
    origin_log::init(config.access_log.as_deref(), config.error_log.as_deref());

    let pid_file = config.pid_file.clone();
    let result = workers::start(config);
    let _ = std::fs::remove_file(&pid_file);
    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{}", e);
            1
        }
    }
}

fn write_pid_file(config: &AppConfig) -> Result<()> {
    std::fs::write(&config.pid_file, format!("{}\n", std::process::id()))
        .map_err(|e| format!("failed to write pid file {}: {}", config.pid_file.display(), e))?;
    Ok(())
}

fn read_pid(config: &AppConfig) -> Option<i32> {
    let content = std::fs::read_to_string(&config.pid_file).ok()?;
    content.trim().parse().ok()
}

fn is_running(config: &AppConfig) -> bool {
    let Some(pid) = read_pid(config) else {
        return false;
    };
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

fn kill_server(config: &AppConfig) -> Result<()> {
    let Some(pid) = read_pid(config) else {
        return Err("pid file is missing or unreadable".into());
    };
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        return Err(format!("failed to signal pid {}", pid).into());
    }
    Ok(())
}

fn display_status(config: &AppConfig) {
    if !is_running(config) {
        println!("Server is not running.");
        return;
    }
    println!("Server Status:");
    if let Some(pid) = read_pid(config) {
        println!("  PID: {}", pid);
    }
    println!("  Workers: {}", config.worker_processes);
    println!(
        "  Total Connections: {}",
        workers::read_shared_counter().unwrap_or(0)
    );
}

/// Classic double fork: the caller's process tree exits, the grandchild
/// runs the server detached from the controlling terminal.
fn daemonise() {
    unsafe {
        match libc::fork() {
            0 => {}
            pid if pid > 0 => std::process::exit(0),
            _ => std::process::exit(1),
        }
        if libc::setsid() < 0 {
            std::process::exit(1);
        }
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
        match libc::fork() {
            0 => {}
            pid if pid > 0 => std::process::exit(0),
            _ => std::process::exit(1),
        }
        libc::umask(0);
        libc::close(libc::STDIN_FILENO);
        libc::close(libc::STDOUT_FILENO);
        libc::close(libc::STDERR_FILENO);
    }
}
