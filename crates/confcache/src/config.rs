use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::Error;

/// Builder for a [`Config`](struct.Config.html).
///
/// # Examples
///
/// ```
/// let _config = confcache::ConfigBuilder::default()
///     .root_dir("/etc/resolver/prefs")
///     .last_good_dir(Some("/etc/resolver/prefs/.last-good".into()))
///     .worker_target(4);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigBuilder {
    #[doc(hidden)]
    pub root_dir: PathBuf,
    #[doc(hidden)]
    pub last_good_dir: Option<PathBuf>,
    #[doc(hidden)]
    pub reject_dir: Option<PathBuf>,
    #[doc(hidden)]
    pub backup_suffix: String,
    #[doc(hidden)]
    pub compression_level: i32,
    #[doc(hidden)]
    pub object_hash_rows: usize,
    #[doc(hidden)]
    pub object_hash_locks: usize,
    #[doc(hidden)]
    pub worker_target: usize,
    #[doc(hidden)]
    pub reload_interval: Duration,
    #[doc(hidden)]
    pub report_server: Option<std::net::SocketAddr>,
}

impl Default for ConfigBuilder {
    fn default() -> ConfigBuilder {
        ConfigBuilder {
            root_dir: PathBuf::from("."),
            last_good_dir: None,
            reject_dir: None,
            backup_suffix: ".last-good".to_owned(),
            compression_level: 6,
            object_hash_rows: 1 << 14,
            object_hash_locks: 32,
            worker_target: num_cpus_or_one(),
            reload_interval: Duration::from_millis(60_000),
            report_server: None,
        }
    }
}

fn num_cpus_or_one() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

macro_rules! supported {
    ($cond:expr, $msg:expr) => {
        if !$cond {
            return Err(Error::Unsupported($msg.to_owned()));
        }
    };
}

macro_rules! builder {
    ($(($name:ident, $get:ident, $set:ident, $t:ty, $desc:expr)),* $(,)?) => {
        $(
            #[doc=$desc]
            pub fn $set(&mut self, to: $t) {
                self.$name = to;
            }

            #[doc=$desc]
            pub fn $name(mut self, to: $t) -> ConfigBuilder {
                self.$name = to;
                self
            }
        )*
    }
}

impl ConfigBuilder {
    /// Returns a default `ConfigBuilder`.
    pub fn new() -> ConfigBuilder {
        Self::default()
    }

    /// Set the root directory that holds the registered prefs files (builder).
    pub fn root_dir<P: AsRef<Path>>(mut self, path: P) -> ConfigBuilder {
        self.root_dir = path.as_ref().to_path_buf();
        self
    }

    /// Set the root directory that holds the registered prefs files.
    pub fn set_root_dir<P: AsRef<Path>>(&mut self, path: P) {
        self.root_dir = path.as_ref().to_path_buf();
    }

    builder!(
        (last_good_dir, get_last_good_dir, set_last_good_dir, Option<PathBuf>,
            "directory that receives verbatim copies of successfully parsed files"),
        (reject_dir, get_reject_dir, set_reject_dir, Option<PathBuf>,
            "directory that receives verbatim copies of files that failed to parse"),
        (backup_suffix, get_backup_suffix, set_backup_suffix, String,
            "suffix appended to a basename to form its last-good sibling"),
        (compression_level, get_compression_level, set_compression_level, i32,
            "gzip compression level used when mirroring bytes into a backup file"),
        (object_hash_rows, get_object_hash_rows, set_object_hash_rows, usize,
            "power-of-two row count for ObjectHash instances created under this config"),
        (object_hash_locks, get_object_hash_locks, set_object_hash_locks, usize,
            "stripe-lock count for ObjectHash instances; 0 disables striping (readers only)"),
        (worker_target, get_worker_target, set_worker_target, usize,
            "number of loader worker threads; 0 drives all parsers synchronously on the config thread"),
        (reload_interval, get_reload_interval, set_reload_interval, Duration,
            "minimum age a completed job must reach on the wait queue before it is reloaded"),
        (report_server, get_report_server, set_report_server, Option<std::net::SocketAddr>,
            "optional UDP address notified with a report packet on each successful load"),
    );

    /// Finalize the configuration, validating it first.
    pub fn build(self) -> Result<Config, Error> {
        self.validate()?;
        Ok(Config { inner: Arc::new(self), refs: Arc::new(AtomicUsize::new(1)) })
    }

    fn validate(&self) -> Result<(), Error> {
        supported!(!self.root_dir.as_os_str().is_empty(), "root_dir must not be empty");
        supported!(
            (0..=9).contains(&self.compression_level),
            "compression_level must be between 0 and 9"
        );
        supported!(
            self.object_hash_rows == 0 || self.object_hash_rows.is_power_of_two(),
            "object_hash_rows must be a power of two"
        );
        Ok(())
    }
}

/// A finalized, cheaply-cloneable [`ConfigBuilder`](struct.ConfigBuilder.html).
///
/// `Config` is handed to every entry point (`Registry::new`, `Worker::spawn`,
/// `ConfLoader::open`) that needs to know directory layout, worker count, or
/// cache sizing. Cloning bumps a shared refcount the way the registered conf
/// objects elsewhere in this crate do, rather than deep-copying the builder.
#[derive(Debug)]
pub struct Config {
    inner: Arc<ConfigBuilder>,
    refs: Arc<AtomicUsize>,
}

impl std::ops::Deref for Config {
    type Target = ConfigBuilder;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Clone for Config {
    fn clone(&self) -> Config {
        self.refs.fetch_add(1, Ordering::SeqCst);
        Config { inner: self.inner.clone(), refs: self.refs.clone() }
    }
}

impl Drop for Config {
    fn drop(&mut self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Config {
    /// Returns a default `Config` rooted at `.`.
    pub fn new() -> Result<Config, Error> {
        ConfigBuilder::default().build()
    }

    /// Number of live clones of this configuration.
    pub fn refcount(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    /// Resolve `path` (as registered) against the configured root directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.inner.root_dir.join(path)
        }
    }
}
