use clap::Parser;
use daemon_context::{
    DaemonContext, Detach, Privileges,
    nix::{sys::stat::Mode, unistd::mkfifo},
};
use std::{
    env,
    fs::{self, File},
    io::{BufRead, BufReader, ErrorKind},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Mutex,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Starts a server that listens on a named pipe for commands
///
/// The named pipe appears in the working directory under the name
/// "daemon.pipe". Every line written to it is a separate command: "print
/// TEXT" logs the text and "quit" stops the server. Logs are written to
/// "daemon.log" in the working directory.
#[derive(Debug, Parser)]
#[command(max_term_width = 80)]
struct Cli {
    /// Run the server as a daemon process
    #[arg(short, long)]
    daemon: bool,

    /// Stay in the foreground even when daemonizing
    #[arg(long, requires = "daemon")]
    no_detach: bool,

    /// Daemon process owner and optional group
    #[arg(short, long, value_name = "OWNER:[GROUP]", requires = "daemon")]
    user: Option<String>,

    /// Working directory
    #[arg(
        short = 'w',
        long,
        value_name = "DIRECTORY",
        default_value = Cli::default_work_dir().into_os_string(),
    )]
    workdir: PathBuf,

    /// Path to the pidfile
    #[arg(short, long, value_name = "FILE", requires = "daemon")]
    pidfile: Option<PathBuf>,
}

impl Cli {
    fn default_work_dir() -> PathBuf {
        let mut path = env::temp_dir();
        path.push(env!("CARGO_PKG_NAME"));
        path
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = fs::create_dir_all(&cli.workdir) {
        eprintln!(
            "failed to create directory '{}': {err}",
            cli.workdir.display()
        );
        return ExitCode::FAILURE;
    }

    let log = match File::options()
        .create(true)
        .append(true)
        .open(cli.workdir.join("daemon.log"))
    {
        Ok(log) => log,
        Err(err) => {
            eprintln!("failed to open log file: {err}");
            return ExitCode::FAILURE;
        }
    };

    let config = daemon_context::options()
        .privileges(cli.user.as_deref().map(Privileges::from))
        .pidfile(cli.pidfile.as_deref())
        .working_directory(Some(&cli.workdir))
        .detach(if cli.no_detach {
            Detach::Never
        } else {
            Detach::Always
        })
        .preserve(&log);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .with_writer(Mutex::new(log))
        .init();

    let result = if cli.daemon {
        DaemonContext::new(config).run(run_server)
    } else {
        env::set_current_dir(&cli.workdir)
            .map_err(BoxError::from)
            .and_then(|()| run_server())
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

type BoxError = Box<dyn std::error::Error>;

fn run_server() -> Result<(), BoxError> {
    const FIFO: &str = "daemon.pipe";

    mkfifo(FIFO, Mode::S_IRWXU)
        .map_err(|err| format!("failed to create named pipe '{FIFO}': {err}"))?;

    info!("server process started");

    let result = serve(Path::new(FIFO));
    remove_file(FIFO);
    result
}

fn serve(fifo: &Path) -> Result<(), BoxError> {
    let mut line = String::new();

    loop {
        // Opening blocks until a writer appears; EOF means it went away.
        let file = File::open(fifo).map_err(|err| {
            format!("failed to open '{}' for reading: {err}", fifo.display())
        })?;
        let mut reader = BufReader::new(file);

        loop {
            line.clear();

            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => (),
                Err(err) => {
                    warn!("failed to read from pipe: {err}");
                    break;
                }
            }

            let (command, args) = line.trim().split_once(' ').unwrap_or((line.trim(), ""));

            match command {
                "print" => info!("{}", args.trim()),
                "quit" => {
                    info!("server process shutting down");
                    return Ok(());
                }
                "" => (),
                _ => warn!("unknown command: {command}"),
            }
        }
    }
}

fn remove_file<P: AsRef<Path>>(path: P) {
    let path = path.as_ref();

    if let Err(err) = fs::remove_file(path)
        && err.kind() != ErrorKind::NotFound
    {
        warn!("failed to remove file '{}': {err}", path.display());
    }
}
