//! Shared setup for both CLI entry points: logging initialization and
//! wiring up the concrete `vhdstore` implementations (the filesystem
//! provider, the real `vhd-util` subprocess tool, no cross-host datapath
//! refresh) behind the one set of `--sr-root`/`--run-dir` flags both
//! binaries accept.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use tracing_subscriber::EnvFilter;

use vhdstore::datapath::NullRefresh;
use vhdstore::metabase::Metabase;
use vhdstore::provider::{FilesystemProvider, OperationMode, StorageProvider};
use vhdstore::vhdtool::ProcessVhdTool;
use vhdstore::{CoalesceDaemon, VolumeEngine};
use vhdstore_shared::VhdStoreResult;

/// Flags both binaries share: which SR to operate on, where host-local run
/// state lives, and how to reach the external VHD tool.
#[derive(Args, Debug, Clone)]
pub struct SrArgs {
    /// Mount point of the storage repository.
    #[arg(long)]
    pub sr_root: PathBuf,

    /// Host-local run directory for GC touch files and tap metadata.
    #[arg(long, default_value = "/var/run/vhdstore")]
    pub run_dir: PathBuf,

    /// Path to the `vhd-util` binary.
    #[arg(long, default_value = "/usr/bin/vhd-util")]
    pub vhd_util: PathBuf,

    /// SQLite busy_timeout, in seconds, for metabase contention.
    #[arg(long, default_value_t = 100)]
    pub busy_timeout_secs: u64,
}

/// The one concrete `VolumeEngine` wiring both binaries use.
pub type Engine = VolumeEngine<FilesystemProvider, ProcessVhdTool, NullRefresh>;

/// The one concrete `CoalesceDaemon` wiring both binaries use.
pub type Daemon = CoalesceDaemon<FilesystemProvider, ProcessVhdTool, NullRefresh>;

impl SrArgs {
    fn open_provider(&self, mode: OperationMode) -> VhdStoreResult<FilesystemProvider> {
        FilesystemProvider::open(&self.sr_root, mode)
    }

    fn open_metabase(&self, provider: &FilesystemProvider) -> VhdStoreResult<Metabase> {
        Metabase::open(&provider.metadata_path(), Duration::from_secs(self.busy_timeout_secs))
    }

    fn tool(&self) -> ProcessVhdTool {
        ProcessVhdTool::new(self.vhd_util.clone())
    }

    pub fn open_engine(&self, mode: OperationMode) -> VhdStoreResult<Engine> {
        let provider = self.open_provider(mode)?;
        let metabase = self.open_metabase(&provider)?;
        Ok(VolumeEngine::new(provider, self.tool(), NullRefresh, metabase, self.run_dir.clone()))
    }

    pub fn open_daemon(&self) -> VhdStoreResult<Daemon> {
        let provider = self.open_provider(OperationMode::ReadWrite)?;
        let metabase = self.open_metabase(&provider)?;
        Ok(CoalesceDaemon::new(provider, self.tool(), NullRefresh, metabase))
    }

    pub fn sr_unique_id(&self) -> VhdStoreResult<String> {
        Ok(self.open_provider(OperationMode::ReadOnly)?.unique_id())
    }
}

/// `RUST_LOG`-driven subscriber, defaulting to `info`. Neither binary logs
/// before this runs; the library crate never initializes logging itself.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}
