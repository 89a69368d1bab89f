//! The hosts table: locally authoritative names, loaded once at
//! startup and served without ever expiring.
//!
//! The format is one `domain address` pair per line, whitespace
//! separated, with `#` starting a comment.  The special address
//! `0.0.0.0` marks a pollution shield: the relay answers `NXDOMAIN`
//! for that name, whatever the query type.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::protocol::wire_types::DomainName;

/// What a hosts-table name resolves to.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HostTarget {
    /// Answer `NXDOMAIN` for every query type.
    Shield,
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

/// One line of the hosts table.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HostEntry {
    pub name: DomainName,
    pub target: HostTarget,
}

/// Parse a string of hosts data.
///
/// # Errors
///
/// If any line cannot be parsed.
pub fn deserialise(data: &str) -> Result<Vec<HostEntry>, Error> {
    let mut entries = Vec::new();
    for line in data.lines() {
        if let Some(entry) = parse_line(line)? {
            entries.push(entry);
        }
    }
    Ok(entries)
}

/// Parse a single line.  Blank lines and comment-only lines yield
/// `None`.
///
/// # Errors
///
/// If the line cannot be parsed.
fn parse_line(line: &str) -> Result<Option<HostEntry>, Error> {
    let uncommented = match line.split_once('#') {
        Some((before, _)) => before,
        None => line,
    };

    let mut fields = uncommented.split_whitespace();
    let (name_str, address_str) = match (fields.next(), fields.next(), fields.next()) {
        (None, _, _) => return Ok(None),
        (Some(name), Some(address), None) => (name, address),
        _ => {
            return Err(Error::ExpectedNameAndAddress {
                line: uncommented.trim().into(),
            })
        }
    };

    let name = DomainName::from_dotted_string(name_str).ok_or_else(|| Error::CouldNotParseName {
        name: name_str.into(),
    })?;

    let target = if address_str == "0.0.0.0" {
        HostTarget::Shield
    } else if address_str.contains('.') {
        HostTarget::V4(Ipv4Addr::from_str(address_str).map_err(|_| {
            Error::CouldNotParseAddress {
                address: address_str.into(),
            }
        })?)
    } else if address_str.contains(':') {
        HostTarget::V6(Ipv6Addr::from_str(address_str).map_err(|_| {
            Error::CouldNotParseAddress {
                address: address_str.into(),
            }
        })?)
    } else {
        return Err(Error::CouldNotParseAddress {
            address: address_str.into(),
        });
    };

    Ok(Some(HostEntry { name, target }))
}

/// An error that can occur reading a hosts table.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Error {
    ExpectedNameAndAddress { line: String },
    CouldNotParseName { name: String },
    CouldNotParseAddress { address: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ExpectedNameAndAddress { line } => {
                write!(f, "expected 'domain address', got '{line}'")
            }
            Error::CouldNotParseName { name } => write!(f, "could not parse name '{name}'"),
            Error::CouldNotParseAddress { address } => {
                write!(f, "could not parse address '{address}'")
            }
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(name: &str) -> DomainName {
        DomainName::from_dotted_string(name).unwrap()
    }

    #[test]
    fn parses_all() {
        let hosts_data = "# hark, a comment!\n\
                          home.lan 192.168.1.10\n\
                          ads.example.com 0.0.0.0\n\
                          \n\
                          printer.lan. ::1\n";

        let entries = deserialise(hosts_data).unwrap();

        assert_eq!(
            vec![
                HostEntry {
                    name: domain("home.lan."),
                    target: HostTarget::V4(Ipv4Addr::new(192, 168, 1, 10)),
                },
                HostEntry {
                    name: domain("ads.example.com."),
                    target: HostTarget::Shield,
                },
                HostEntry {
                    name: domain("printer.lan."),
                    target: HostTarget::V6(Ipv6Addr::LOCALHOST),
                },
            ],
            entries
        );
    }

    #[test]
    fn parse_line_appends_trailing_dot() {
        let entry = parse_line("home.lan 10.0.0.1").unwrap().unwrap();
        assert_eq!("home.lan.", entry.name.to_dotted_string());
    }

    #[test]
    fn parse_line_skips_blank_and_comment_lines() {
        assert_eq!(Ok(None), parse_line(""));
        assert_eq!(Ok(None), parse_line("   "));
        assert_eq!(Ok(None), parse_line("# home.lan 10.0.0.1"));
    }

    #[test]
    fn parse_line_allows_trailing_comment() {
        let entry = parse_line("home.lan 10.0.0.1 # the NAS").unwrap().unwrap();
        assert_eq!(HostTarget::V4(Ipv4Addr::new(10, 0, 0, 1)), entry.target);
    }

    #[test]
    fn parse_line_rejects_extra_fields() {
        assert_eq!(
            Err(Error::ExpectedNameAndAddress {
                line: "home.lan 10.0.0.1 10.0.0.2".into()
            }),
            parse_line("home.lan 10.0.0.1 10.0.0.2")
        );
    }

    #[test]
    fn parse_line_rejects_bad_address() {
        assert_eq!(
            Err(Error::CouldNotParseAddress {
                address: "10.0.0".into()
            }),
            parse_line("home.lan 10.0.0")
        );
        assert_eq!(
            Err(Error::CouldNotParseAddress {
                address: "localhost".into()
            }),
            parse_line("home.lan localhost")
        );
    }

    #[test]
    fn parse_line_rejects_bad_name() {
        assert_eq!(
            Err(Error::CouldNotParseName {
                name: "home..lan".into()
            }),
            parse_line("home..lan 10.0.0.1")
        );
    }

    #[test]
    fn shield_marker_must_be_exact() {
        // any other address in 0.0.0.0/8 is still an ordinary A record
        let entry = parse_line("ads.example.com 0.0.0.1").unwrap().unwrap();
        assert_eq!(HostTarget::V4(Ipv4Addr::new(0, 0, 0, 1)), entry.target);
    }
}
