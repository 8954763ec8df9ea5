//! Bridge configuration.
//!
//! Passed explicitly into [`Bridge`](crate::Bridge); nothing here is read
//! from globals at request time.
//!
//! ```rust
//! use ferry::Config;
//!
//! let config = Config::default()
//!     .body_size_limit(Some(1024 * 1024))
//!     .env_var("REGION", "eu-west-1");
//! assert_eq!(config.limit(), Some(1024 * 1024));
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use crate::event::Env;

/// Default cap on a request body without a `content-length`.
pub const DEFAULT_BODY_SIZE_LIMIT: u64 = 512 * 1024;

/// Default number of bytes the hyper sink buffers before `write` reports full.
pub const DEFAULT_WRITE_HIGH_WATER_MARK: usize = 16 * 1024;

/// Header carrying the route-match descriptor in function mode.
pub const ROUTE_MATCH_HEADER: &str = "x-route-match";

#[derive(Clone, Debug)]
pub struct Config {
    body_size_limit: Option<u64>,
    read_high_water_mark: usize,
    write_high_water_mark: usize,
    scheme: String,
    route_match_header: String,
    env: Arc<Env>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            body_size_limit: Some(DEFAULT_BODY_SIZE_LIMIT),
            read_high_water_mark: 1,
            write_high_water_mark: DEFAULT_WRITE_HIGH_WATER_MARK,
            scheme: "https".to_owned(),
            route_match_header: ROUTE_MATCH_HEADER.to_owned(),
            env: Arc::new(BTreeMap::new()),
        }
    }
}

impl Config {
    /// Defaults, overridden by `BODY_SIZE_LIMIT` and `ORIGIN_SCHEME`.
    ///
    /// `BODY_SIZE_LIMIT` accepts plain bytes or a `K`/`M`/`G` suffix
    /// (`512K`, `10M`). `0` and `Infinity` lift the limit entirely.
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("BODY_SIZE_LIMIT") {
            match parse_size(&raw) {
                Some(limit) => config.body_size_limit = limit,
                None => warn!(value = %raw, "ignoring invalid BODY_SIZE_LIMIT"),
            }
        }

        if let Ok(scheme) = std::env::var("ORIGIN_SCHEME") {
            match scheme.as_str() {
                "http" | "https" => config.scheme = scheme,
                _ => warn!(value = %scheme, "ignoring invalid ORIGIN_SCHEME"),
            }
        }

        config
    }

    /// Limit for bodies without a `content-length`. `None` means unlimited.
    pub fn body_size_limit(mut self, limit: Option<u64>) -> Self {
        self.body_size_limit = limit;
        self
    }

    /// Inbound chunks queued before the transport is asked to pause. Minimum 1.
    pub fn read_high_water_mark(mut self, chunks: usize) -> Self {
        self.read_high_water_mark = chunks.max(1);
        self
    }

    /// Outbound bytes the hyper sink buffers before reporting full. Minimum 1.
    pub fn write_high_water_mark(mut self, bytes: usize) -> Self {
        self.write_high_water_mark = bytes.max(1);
        self
    }

    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn route_match_header(mut self, name: impl Into<String>) -> Self {
        self.route_match_header = name.into();
        self
    }

    /// Adds one entry to the environment bag handed to every handler.
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.env).insert(key.into(), value.into());
        self
    }

    pub fn limit(&self) -> Option<u64> { self.body_size_limit }
    pub fn read_hwm(&self) -> usize { self.read_high_water_mark }
    pub fn write_hwm(&self) -> usize { self.write_high_water_mark }
    pub fn url_scheme(&self) -> &str { &self.scheme }
    pub fn match_header(&self) -> &str { &self.route_match_header }
    pub fn env(&self) -> Arc<Env> { Arc::clone(&self.env) }
}

/// `Some(None)` is "unlimited", `None` is "unparseable".
fn parse_size(raw: &str) -> Option<Option<u64>> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("infinity") {
        return Some(None);
    }

    let (digits, multiplier) = match raw.char_indices().last()? {
        (i, 'K' | 'k') => (&raw[..i], 1024),
        (i, 'M' | 'm') => (&raw[..i], 1024 * 1024),
        (i, 'G' | 'g') => (&raw[..i], 1024 * 1024 * 1024),
        _ => (raw, 1),
    };

    let value = digits.parse::<u64>().ok()?.checked_mul(multiplier)?;
    Some((value != 0).then_some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_size_suffixes() {
        assert_eq!(parse_size("1024"), Some(Some(1024)));
        assert_eq!(parse_size("512K"), Some(Some(512 * 1024)));
        assert_eq!(parse_size("2m"), Some(Some(2 * 1024 * 1024)));
        assert_eq!(parse_size("0"), Some(None));
        assert_eq!(parse_size("Infinity"), Some(None));
        assert_eq!(parse_size("lots"), None);
        assert_eq!(parse_size(""), None);
    }

    #[test]
    fn high_water_marks_never_reach_zero() {
        let config = Config::default().read_high_water_mark(0).write_high_water_mark(0);
        assert_eq!(config.read_hwm(), 1);
        assert_eq!(config.write_hwm(), 1);
    }

    #[test]
    fn env_bag_is_shared_not_copied() {
        let config = Config::default().env_var("A", "1");
        let a = config.env();
        let b = config.env();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.get("A").map(String::as_str), Some("1"));
    }
}
