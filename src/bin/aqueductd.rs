use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use aqueduct::cnc::{CncFile, ErrorLog};
use aqueduct::config::{DriverConfig, ThreadingMode};
use aqueduct::counters::{CounterTable, STATE_ALLOCATED};
use aqueduct::driver::MediaDriver;

#[derive(Parser)]
#[command(name = "aqueductd", version, about = "Aqueduct media driver")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the media driver until interrupted or terminated by a client.
    Run {
        #[arg(long = "dir")]
        dir: Option<PathBuf>,
        #[arg(long = "threading-mode", default_value = "shared")]
        threading_mode: String,
        #[arg(long = "delete-dir-on-start")]
        delete_dir_on_start: bool,
    },
    /// Render the control file, counters and error log of a driver directory.
    Inspect {
        dir: PathBuf,
        #[arg(long = "counters")]
        counters: bool,
    },
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { dir, threading_mode, delete_dir_on_start } => {
            cmd_run(dir, &threading_mode, delete_dir_on_start)
        }
        Commands::Inspect { dir, counters } => {
            let mut out = io::BufWriter::new(io::stdout());
            cmd_inspect(&dir, counters, &mut out)
        }
    }
}

fn cmd_run(dir: Option<PathBuf>, threading_mode: &str, delete_dir_on_start: bool) -> anyhow::Result<()> {
    let mut config = DriverConfig::from_env().context("driver configuration")?;
    if let Some(dir) = dir {
        config.dir = dir;
    }
    config.threading_mode = match threading_mode {
        "shared" => ThreadingMode::Shared,
        "shared-network" => ThreadingMode::SharedNetwork,
        "dedicated" => ThreadingMode::Dedicated,
        other => anyhow::bail!("unknown threading mode: {other}"),
    };
    config.dir_delete_on_start = delete_dir_on_start;

    log::info!("starting driver dir={}", config.dir.display());
    let driver = MediaDriver::launch(config).context("driver launch")?;

    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
    ctrlc_handler(move || {
        let _ = stop_tx.send(());
    });
    let _ = stop_rx.recv();

    log::info!("stopping driver");
    driver.close();
    Ok(())
}

static SIGNAL_PIPE_WRITE_FD: std::sync::atomic::AtomicI32 = std::sync::atomic::AtomicI32::new(-1);

extern "C" fn on_signal(_sig: libc::c_int) {
    let fd = SIGNAL_PIPE_WRITE_FD.load(std::sync::atomic::Ordering::Relaxed);
    if fd >= 0 {
        let byte = 1u8;
        // SAFETY: write(2) is async-signal-safe and the fd outlives the
        // handler registration.
        unsafe {
            libc::write(fd, &byte as *const u8 as *const _, 1);
        }
    }
}

/// INT/TERM hook via the classic self-pipe, so the main thread can park on a
/// blocking read instead of polling a flag.
fn ctrlc_handler(stop: impl FnOnce() + Send + 'static) {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: pipe(2) with a valid two-element array.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return;
    }
    let read_fd = fds[0];
    SIGNAL_PIPE_WRITE_FD.store(fds[1], std::sync::atomic::Ordering::Relaxed);
    // SAFETY: installing an async-signal-safe handler.
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }

    std::thread::spawn(move || {
        let mut byte = 0u8;
        // SAFETY: blocking read on our own pipe.
        unsafe {
            libc::read(read_fd, &mut byte as *mut u8 as *mut _, 1);
        }
        stop();
    });
}

fn cmd_inspect(dir: &PathBuf, with_counters: bool, out: &mut dyn Write) -> anyhow::Result<()> {
    let cnc = CncFile::open(dir).context("open cnc file")?;
    writeln!(out, "dir={}", dir.display())?;
    writeln!(out, "driver_pid={}", cnc.driver_pid())?;
    writeln!(out, "start_timestamp_ms={}", cnc.start_timestamp_ms())?;
    writeln!(out, "heartbeat_ms={}", cnc.heartbeat_ms())?;
    writeln!(
        out,
        "to_driver_len={} to_clients_len={} counters_metadata_len={} counters_values_len={} error_log_len={}",
        cnc.to_driver.len(),
        cnc.to_clients.len(),
        cnc.counters_metadata.len(),
        cnc.counters_values.len(),
        cnc.error_log.len()
    )?;

    if with_counters {
        let table = CounterTable::new(cnc.counters_values, cnc.counters_metadata, 0);
        for id in 0..table.capacity() as i32 {
            if table.state(id) == STATE_ALLOCATED {
                writeln!(
                    out,
                    "counter id={} type={} value={} owner={} registration={} label={:?}",
                    id,
                    table.type_id(id),
                    table.counter(id).get_volatile(),
                    table.owner_id(id),
                    table.registration_id(id),
                    table.label(id)
                )?;
            }
        }
    }

    let error_log = ErrorLog::new(cnc.error_log);
    for observation in error_log.read() {
        writeln!(
            out,
            "error count={} first_ms={} last_ms={} message={:?}",
            observation.observation_count,
            observation.first_observation_ms,
            observation.last_observation_ms,
            observation.message
        )?;
    }
    Ok(())
}
