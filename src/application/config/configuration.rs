use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Configuration {
    #[clap(long, default_value_os_t = default_index_dir())]
    #[serde(default = "default_index_dir")]
    /// Directory holding one subdirectory per index
    pub index_dir: PathBuf,

    #[clap(long, default_value_os_t = default_registry_file())]
    #[serde(default = "default_registry_file")]
    /// Append-only list of indexed roots, one absolute path per line
    pub registry_file: PathBuf,

    #[clap(long, default_value_os_t = default_journal_dir())]
    #[serde(default = "default_journal_dir")]
    /// Directory of pending-change journals written while the app is offline
    pub journal_dir: PathBuf,

    #[clap(long, default_value_t = default_worker_count())]
    #[serde(default = "default_worker_count")]
    /// Workers per index; half read files, half build batches
    pub worker_count: usize,

    #[clap(long, default_value_t = default_channel_buffer_size())]
    #[serde(default = "default_channel_buffer_size")]
    /// Base capacity of the pipeline channels
    pub channel_buffer_size: usize,

    #[clap(long, default_value_t = default_batch_memory_limit())]
    #[serde(default = "default_batch_memory_limit")]
    /// Flush a batch once its staged content reaches this many bytes
    pub batch_memory_limit: usize,

    #[clap(long, default_value_t = default_flush_interval_ms())]
    #[serde(default = "default_flush_interval_ms")]
    /// Milliseconds between forced flushes of a slow-filling batch
    pub flush_interval_ms: u64,

    #[clap(long, default_value_t = default_debounce_ms())]
    #[serde(default = "default_debounce_ms")]
    /// Milliseconds the watcher waits for events to settle
    pub debounce_ms: u64,

    #[clap(long, default_value_t = default_read_chunk_size())]
    #[serde(default = "default_read_chunk_size")]
    /// Bytes per pooled read buffer
    pub read_chunk_size: usize,

    #[clap(long, default_value_t = default_max_file_size())]
    #[serde(default = "default_max_file_size")]
    /// Skip files larger than this many bytes (0 disables the cap)
    pub max_file_size: u64,

    #[clap(long, default_value_t = default_search_limit())]
    #[serde(default = "default_search_limit")]
    /// Per-index cap on hits returned for one query
    pub search_limit: usize,
}

impl Configuration {
    pub fn index_path(&self, short_name: &str) -> PathBuf {
        self.index_dir.join(short_name)
    }

    pub fn journal_path(&self, short_name: &str) -> PathBuf {
        self.journal_dir.join(format!("{short_name}.log"))
    }

    /// Directory where logs are written to
    pub fn log_dir(&self) -> PathBuf {
        self.index_dir.join("logs")
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms.max(1))
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            index_dir: default_index_dir(),
            registry_file: default_registry_file(),
            journal_dir: default_journal_dir(),
            worker_count: default_worker_count(),
            channel_buffer_size: default_channel_buffer_size(),
            batch_memory_limit: default_batch_memory_limit(),
            flush_interval_ms: default_flush_interval_ms(),
            debounce_ms: default_debounce_ms(),
            read_chunk_size: default_read_chunk_size(),
            max_file_size: default_max_file_size(),
            search_limit: default_search_limit(),
        }
    }
}

fn default_index_dir() -> PathBuf {
    "index".into()
}

fn default_registry_file() -> PathBuf {
    "indexes.txt".into()
}

fn default_journal_dir() -> PathBuf {
    "pending".into()
}

fn default_worker_count() -> usize {
    4
}

fn default_channel_buffer_size() -> usize {
    16
}

fn default_batch_memory_limit() -> usize {
    32 * 1024 * 1024
}

fn default_flush_interval_ms() -> u64 {
    10_000
}

fn default_debounce_ms() -> u64 {
    10_000
}

fn default_read_chunk_size() -> usize {
    1024 * 1024
}

fn default_max_file_size() -> u64 {
    64 * 1024 * 1024
}

fn default_search_limit() -> usize {
    1000
}
