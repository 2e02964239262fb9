//! Ambient process-wide configuration.
//!
//! A flat, `Copy`-able struct loaded once at startup, in the same spirit as
//! the teacher crate's own `EventLoopConfig`: a plain struct with a
//! `Default` impl, no file parsing, no third-party config crate. Values are
//! read field-by-field from `NBIO_`-prefixed environment variables so the
//! whole thing stays allocation-free after `from_env` returns.

use std::env;
use std::time::Duration;

/// Process-wide knobs for the modules in this crate.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Override for the AFS worker-slot rw-buffer size, in bytes. `None`
    /// means "use the computed page-aligned default" (§6.2).
    pub afs_rw_buf_len: Option<usize>,
    /// Default per-request timeout for the HTTPS module.
    pub https_timeout: Duration,
    /// Default transport verbosity for the HTTPS module.
    pub https_verbose: bool,
    /// Prefix prepended to this crate's `log` target strings (e.g. `"nbio"`
    /// becomes the `target:` passed to `trace!`/`debug!`/... call sites).
    pub log_target: &'static str,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            afs_rw_buf_len: None,
            https_timeout: Duration::from_secs(30),
            https_verbose: false,
            log_target: "nbio",
        }
    }
}

impl Config {
    /// Loads configuration from `NBIO_AFS_RW_BUF_LEN`, `NBIO_HTTPS_TIMEOUT_S`,
    /// `NBIO_HTTPS_VERBOSE` and `NBIO_LOG_TARGET`, falling back to
    /// [`Config::default`] for any variable that is unset or fails to parse.
    pub fn from_env() -> Config {
        let default = Config::default();
        Config {
            afs_rw_buf_len: env::var("NBIO_AFS_RW_BUF_LEN")
                .ok()
                .and_then(|v| v.parse().ok()),
            https_timeout: env::var("NBIO_HTTPS_TIMEOUT_S")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.https_timeout),
            https_verbose: env::var("NBIO_HTTPS_VERBOSE")
                .ok()
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(default.https_verbose),
            log_target: env::var("NBIO_LOG_TARGET")
                .ok()
                .map(|v| &*Box::leak(v.into_boxed_str()))
                .unwrap_or(default.log_target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_no_buf_override() {
        assert_eq!(Config::default().afs_rw_buf_len, None);
    }

    #[test]
    fn default_log_target_is_nbio() {
        assert_eq!(Config::default().log_target, "nbio");
    }
}
