//! One-shot volume operations: `vhd-volume <verb> --sr-root ... [args]`.
//! Each invocation opens the SR, performs one operation, and exits — the
//! long-running side of this system is `vhd-gcd`, not this binary.

use std::process::ExitCode;

use clap::{Parser, Subcommand};

use vhdstore::provider::OperationMode;
use vhdstore::VdiDescriptor;
use vhdstore_cli::SrArgs;

#[derive(Parser)]
#[command(name = "vhd-volume", version, about = "Volume operations on a VHD chain storage repository")]
struct Cli {
    #[command(flatten)]
    sr: SrArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new VDI.
    Create {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        size_bytes: u64,
    },
    /// Destroy a VDI.
    Destroy { uuid: String },
    /// Resize a VDI's leaf.
    Resize { uuid: String, new_size_bytes: u64 },
    /// Print one VDI's metadata.
    Stat { uuid: String },
    /// List every VDI in the SR.
    Ls,
    /// Rename a VDI.
    SetName { uuid: String, name: String },
    /// Change a VDI's description.
    SetDescription { uuid: String, description: String },
    /// Copy-on-write clone of a VDI's current leaf.
    Clone { uuid: String },
    /// Create the tap metadata for a VDI without opening it.
    Attach { uuid: String },
    /// Mark a VDI active on `host` and open its tap.
    Activate { uuid: String, host: String },
    /// Clear a VDI's active host and close its tap.
    Deactivate { uuid: String },
    /// Remove a VDI's tap metadata.
    Detach { uuid: String },
    /// Enter the epoch boundary for a non-persistent or persistent leaf.
    EpochOpen {
        uuid: String,
        #[arg(long)]
        persistent: bool,
    },
    /// Leave the epoch boundary, resetting non-persistent leaves.
    EpochClose { uuid: String },
    /// Touch `gc-running` for this SR.
    GcStart,
    /// Unlink `gc-running` and wait for `gc-exited`.
    GcStop {
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
}

fn main() -> ExitCode {
    vhdstore_cli::init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        tracing::error!(error = %e, "vhd-volume command failed");
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(cli: Cli) -> vhdstore_shared::VhdStoreResult<()> {
    match cli.command {
        Command::Create { name, description, size_bytes } => {
            let mut engine = cli.sr.open_engine(OperationMode::ReadWrite)?;
            let vdi = engine.create(&name, &description, size_bytes)?;
            print_descriptor(&vdi);
        }
        Command::Destroy { uuid } => {
            cli.sr.open_engine(OperationMode::ReadWrite)?.destroy(&uuid)?;
        }
        Command::Resize { uuid, new_size_bytes } => {
            cli.sr.open_engine(OperationMode::ReadWrite)?.resize(&uuid, new_size_bytes)?;
        }
        Command::Stat { uuid } => {
            let vdi = cli.sr.open_engine(OperationMode::ReadOnly)?.stat(&uuid)?;
            print_descriptor(&vdi);
        }
        Command::Ls => {
            for vdi in cli.sr.open_engine(OperationMode::ReadOnly)?.ls()? {
                print_descriptor(&vdi);
            }
        }
        Command::SetName { uuid, name } => {
            cli.sr.open_engine(OperationMode::ReadWrite)?.set_name(&uuid, &name)?;
        }
        Command::SetDescription { uuid, description } => {
            cli.sr
                .open_engine(OperationMode::ReadWrite)?
                .set_description(&uuid, &description)?;
        }
        Command::Clone { uuid } => {
            let vdi = cli.sr.open_engine(OperationMode::ReadWrite)?.clone(&uuid)?;
            print_descriptor(&vdi);
        }
        Command::Attach { uuid } => {
            let path = cli.sr.open_engine(OperationMode::ReadWrite)?.attach(&uuid)?;
            println!("{}", path.display());
        }
        Command::Activate { uuid, host } => {
            cli.sr.open_engine(OperationMode::ReadWrite)?.activate(&uuid, &host)?;
        }
        Command::Deactivate { uuid } => {
            cli.sr.open_engine(OperationMode::ReadWrite)?.deactivate(&uuid)?;
        }
        Command::Detach { uuid } => {
            cli.sr.open_engine(OperationMode::ReadWrite)?.detach(&uuid)?;
        }
        Command::EpochOpen { uuid, persistent } => {
            cli.sr.open_engine(OperationMode::ReadWrite)?.epoch_open(&uuid, persistent)?;
        }
        Command::EpochClose { uuid } => {
            cli.sr.open_engine(OperationMode::ReadWrite)?.epoch_close(&uuid)?;
        }
        Command::GcStart => {
            let sr_unique_id = cli.sr.sr_unique_id()?;
            vhdstore::gc::start_gc(&cli.sr.run_dir, &sr_unique_id)?;
        }
        Command::GcStop { timeout_secs } => {
            let sr_unique_id = cli.sr.sr_unique_id()?;
            vhdstore::gc::stop_gc(&cli.sr.run_dir, &sr_unique_id, std::time::Duration::from_secs(timeout_secs))?;
        }
    }
    Ok(())
}

fn print_descriptor(vdi: &VdiDescriptor) {
    println!(
        "{}\tname={}\tvsize={}\tphys={}\turi={}",
        vdi.uuid, vdi.name, vdi.vsize, vdi.physical_utilisation, vdi.uri
    );
}
