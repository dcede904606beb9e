//! Node, mapping and advanced mapping registries.
//!
//! The registries validate input shape and delegate every check that must
//! hold under concurrency (uniqueness, references, run state) to the store,
//! which performs it inside the same transaction as the write.

mod advanced;
mod mappings;
mod nodes;

pub use advanced::*;
pub use mappings::*;
pub use nodes::*;

use regex::Regex;
use std::net::IpAddr;
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// Names are used as keys and in URLs.
pub(crate) fn validate_name(kind: &str, name: &str) -> Result<()> {
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    let re = NAME_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,63}$").unwrap());
    if !re.is_match(name) {
        return Err(Error::Validation(format!(
            "{} name '{}' must be 1-64 characters of letters, digits, '.', '_' or '-'",
            kind, name
        )));
    }
    Ok(())
}

/// Accepts IP literals and DNS host names.
pub(crate) fn validate_host(field: &str, host: &str) -> Result<()> {
    static HOST_RE: OnceLock<Regex> = OnceLock::new();
    let re = HOST_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$")
            .unwrap()
    });
    if host.parse::<IpAddr>().is_ok() || (host.len() <= 253 && re.is_match(host)) {
        return Ok(());
    }
    Err(Error::Validation(format!("{} '{}' is not a valid host", field, host)))
}

pub(crate) fn validate_ip(field: &str, ip: &str) -> Result<()> {
    ip.parse::<IpAddr>()
        .map(|_| ())
        .map_err(|_| Error::Validation(format!("{} '{}' is not a valid IP address", field, ip)))
}

pub(crate) fn validate_port(field: &str, port: u16) -> Result<()> {
    if port == 0 {
        return Err(Error::Validation(format!("{} must be between 1 and 65535", field)));
    }
    Ok(())
}
