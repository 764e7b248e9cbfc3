//! Parser for `resolv.conf`-style resolver configuration files.
//!
//! Only the directives that make sense to hand to a container are kept:
//!
//! * `nameserver <addr>` is repeatable and keeps file order.
//! * `domain <name>` overwrites any earlier `domain` line.
//! * `search <name>...` and `options <opt>...` append every field.
//!
//! Blank lines, comments (`#` or `;`), lines with a single field and unknown
//! directives are skipped.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::types::DnsConfig;

#[derive(Debug, Error)]
pub enum ResolvConfError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Parse the resolver configuration at `path`.
pub fn parse_file(path: &Path) -> Result<DnsConfig, ResolvConfError> {
    let io_err = |source| ResolvConfError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(io_err)?;
    parse(BufReader::new(file)).map_err(io_err)
}

/// Parse resolver configuration from any buffered reader.
///
/// Either the whole input is consumed or the first read error is returned.
pub fn parse<R: BufRead>(reader: R) -> std::io::Result<DnsConfig> {
    let mut dns = DnsConfig::default();

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            continue;
        }

        match fields[0] {
            "nameserver" => dns.nameservers.push(fields[1].to_string()),
            "domain" => dns.domain = Some(fields[1].to_string()),
            "search" => dns.search.extend(fields[1..].iter().map(|s| s.to_string())),
            "options" => dns
                .options
                .extend(fields[1..].iter().map(|s| s.to_string())),
            _ => {}
        }
    }

    Ok(dns)
}
