use crate::bus::common::{Error, Result};

/// A decoded transport address (§6 "Addresses"). Retained verbatim as a
/// string on the transport for diagnostics; this is the parsed form used
/// only at construction time to pick a constructor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    UnixPath(String),
    UnixAbstract(String),
    Tcp { host: String, port: u16 },
}

/// Parses `unix:path=<path>`, `unix:abstract=<name>`, and
/// `tcp:host=<host>,port=<port>` (§6). Unknown forms and missing required
/// keys are rejected rather than guessed at.
pub fn parse_address(s: &str) -> Result<Address> {
    let (kind, rest) = s
        .split_once(':')
        .ok_or_else(|| Error::new(format!("malformed address, missing ':': {}", s)))?;

    let mut pairs = std::collections::HashMap::new();
    for kv in rest.split(',') {
        if kv.is_empty() {
            continue;
        }
        let (k, v) = kv
            .split_once('=')
            .ok_or_else(|| Error::new(format!("malformed address component '{}' in: {}", kv, s)))?;
        pairs.insert(k, v);
    }

    match kind {
        "unix" => {
            if let Some(path) = pairs.get("path") {
                Ok(Address::UnixPath(path.to_string()))
            } else if let Some(name) = pairs.get("abstract") {
                Ok(Address::UnixAbstract(name.to_string()))
            } else {
                Err(Error::new(format!("unix address missing 'path' or 'abstract': {}", s)))
            }
        }
        "tcp" => {
            let host = pairs
                .get("host")
                .ok_or_else(|| Error::new(format!("tcp address missing 'host': {}", s)))?
                .to_string();
            let port: u16 = pairs
                .get("port")
                .ok_or_else(|| Error::new(format!("tcp address missing 'port': {}", s)))?
                .parse()
                .map_err(|_| Error::new(format!("tcp address has non-numeric port: {}", s)))?;
            Ok(Address::Tcp { host, port })
        }
        other => Err(Error::new(format!("unsupported address kind '{}'", other))),
    }
}
