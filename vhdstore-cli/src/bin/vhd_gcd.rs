//! Long-running coalesce daemon: one process per SR. Recovers any
//! in-flight journal/refresh entries left by a prior crash, touches
//! `gc-running`, then loops `run_one_iteration` until `gc-running` is
//! removed, marking `gc-exited` on the way out.

use std::process::ExitCode;

use clap::Parser;

use vhdstore::gc;
use vhdstore_cli::SrArgs;

#[derive(Parser)]
#[command(name = "vhd-gcd", version, about = "Coalesce daemon for a VHD chain storage repository")]
struct Cli {
    #[command(flatten)]
    sr: SrArgs,
}

fn main() -> ExitCode {
    vhdstore_cli::init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        tracing::error!(error = %e, "vhd-gcd exited with an error");
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(cli: Cli) -> vhdstore_shared::VhdStoreResult<()> {
    let sr_unique_id = cli.sr.sr_unique_id()?;
    let mut daemon = cli.sr.open_daemon()?;

    tracing::info!(sr = %sr_unique_id, "coalesce daemon starting, recovering from any prior crash");
    daemon.recover()?;

    gc::start_gc(&cli.sr.run_dir, &sr_unique_id)?;
    tracing::info!(sr = %sr_unique_id, "coalesce daemon running");

    while gc::is_running(&cli.sr.run_dir, &sr_unique_id) {
        match daemon.run_one_iteration() {
            Ok(did_work) => {
                if did_work {
                    tracing::debug!(sr = %sr_unique_id, "coalesce iteration did work");
                }
            }
            Err(e) => {
                tracing::warn!(sr = %sr_unique_id, error = %e, "coalesce iteration failed, retrying after sleep");
            }
        }

        let run_dir = cli.sr.run_dir.clone();
        let id = sr_unique_id.clone();
        vhdstore_cli::Daemon::sleep_until_woken(move || gc::is_running(&run_dir, &id));
    }

    tracing::info!(sr = %sr_unique_id, "coalesce daemon stopping");
    gc::mark_exited(&cli.sr.run_dir, &sr_unique_id)?;
    Ok(())
}
