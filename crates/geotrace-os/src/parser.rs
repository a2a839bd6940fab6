//! Incremental parsing of traceroute stdout lines.
//!
//! The parser is pure (no process I/O) so every platform's format is
//! unit-testable anywhere: feed it raw lines, get classified results.

use crate::platform;
use geotrace_core::{HostOs, TraceError};
use regex::Regex;
use std::net::IpAddr;

/// Result of classifying one stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    /// A responding hop.
    Hop {
        ip: IpAddr,
        hostname: Option<String>,
        latency_ms: u32,
    },
    /// A lost probe (`*` token).
    Lost,
    /// Header, noise, or terminator; carries no hop data.
    Skipped,
}

/// Stateful line parser for one traceroute run.
pub struct LineParser {
    os: HostOs,
    resolve_hostname: bool,
    headers_remaining: usize,
    ms_token: Regex,
}

impl LineParser {
    pub fn new(os: HostOs, resolve_hostname: bool) -> Self {
        Self {
            os,
            resolve_hostname,
            headers_remaining: platform::header_lines(os),
            // Rewrites "<5 ms" / "2.345 ms" timing tokens to bare numbers.
            ms_token: Regex::new(r"<?(\d+(?:\.\d+)?)\s*ms").expect("static regex"),
        }
    }

    pub fn parse_line(&mut self, raw: &str) -> Result<ParsedLine, TraceError> {
        if self.headers_remaining > 0 {
            self.headers_remaining -= 1;
            return Ok(ParsedLine::Skipped);
        }

        let rewritten = self
            .ms_token
            .replacen(raw, platform::timing_columns(self.os), "$1");
        let tokens: Vec<&str> = rewritten.split_whitespace().collect();

        if tokens.is_empty() || is_noise(&rewritten) {
            return Ok(ParsedLine::Skipped);
        }
        if tokens.contains(&"*") {
            return Ok(ParsedLine::Lost);
        }

        match self.os {
            HostOs::Windows => self.parse_windows(&tokens, raw),
            HostOs::Linux | HostOs::MacOs => self.parse_unix(&tokens, raw),
        }
    }

    /// Windows hop line after rewriting:
    /// `1 1 1 1 192.168.1.1` or `2 10 12 11 gw.example.net [10.0.0.2]`.
    fn parse_windows(&self, tokens: &[&str], raw: &str) -> Result<ParsedLine, TraceError> {
        if tokens.len() < 5 {
            return Err(TraceError::UnparseableLine(raw.to_string()));
        }

        let mut sum = 0.0;
        for token in &tokens[1..4] {
            let ms: f64 = token
                .parse()
                .map_err(|_| TraceError::UnparseableLine(raw.to_string()))?;
            sum += ms;
        }
        let latency_ms = (sum / 3.0) as u32;

        let last = tokens[tokens.len() - 1];
        let (ip_text, hostname) = if last.starts_with('[') && last.ends_with(']') {
            let name = tokens[4..tokens.len() - 1].join(" ");
            let hostname = if self.resolve_hostname && !name.is_empty() {
                Some(name)
            } else {
                None
            };
            (&last[1..last.len() - 1], hostname)
        } else {
            (last, None)
        };

        let ip: IpAddr = ip_text
            .parse()
            .map_err(|_| TraceError::UnparseableLine(raw.to_string()))?;

        Ok(ParsedLine::Hop {
            ip,
            hostname,
            latency_ms,
        })
    }

    /// Unix hop line after rewriting (`-q 1`, single timing column):
    /// `1 gw.example.net (10.0.0.2) 3.9` or numeric `1 10.0.0.1 0.5`.
    fn parse_unix(&self, tokens: &[&str], raw: &str) -> Result<ParsedLine, TraceError> {
        if tokens.len() < 3 {
            return Err(TraceError::UnparseableLine(raw.to_string()));
        }

        let paren = tokens
            .iter()
            .position(|t| t.starts_with('(') && t.ends_with(')'));

        let (ip, hostname, latency_token) = match paren {
            Some(i) if i >= 2 && i + 1 < tokens.len() => {
                let inner = &tokens[i][1..tokens[i].len() - 1];
                let ip: IpAddr = inner
                    .parse()
                    .map_err(|_| TraceError::UnparseableLine(raw.to_string()))?;
                // The name token is a hostname only when it is not just
                // the address printed twice.
                let name = tokens[i - 1];
                let hostname = if self.resolve_hostname && name.parse::<IpAddr>().is_err() {
                    Some(name.to_string())
                } else {
                    None
                };
                (ip, hostname, tokens[i + 1])
            }
            _ => {
                let ip: IpAddr = tokens[1]
                    .parse()
                    .map_err(|_| TraceError::UnparseableLine(raw.to_string()))?;
                (ip, None, tokens[2])
            }
        };

        let latency: f64 = latency_token
            .parse()
            .map_err(|_| TraceError::UnparseableLine(raw.to_string()))?;

        Ok(ParsedLine::Hop {
            ip,
            hostname,
            latency_ms: latency as u32,
        })
    }
}

/// Known benign noise that can appear after the header block.
fn is_noise(line: &str) -> bool {
    let trimmed = line.trim();
    let lower = trimmed.to_ascii_lowercase();
    lower.contains("multiple addresses")
        || lower.contains("over a maximum")
        || lower.starts_with("tracing route to")
        || lower.starts_with("trace complete")
        || lower.starts_with("traceroute to ")
        || lower.starts_with("traceroute6 to ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn parser_past_headers(os: HostOs, resolve_hostname: bool) -> LineParser {
        let mut parser = LineParser::new(os, resolve_hostname);
        for _ in 0..platform::header_lines(os) {
            parser.parse_line("").unwrap();
        }
        parser
    }

    #[test]
    fn test_windows_sub_millisecond_line() {
        let mut parser = parser_past_headers(HostOs::Windows, false);
        let parsed = parser
            .parse_line("  1    <1 ms    <1 ms    <1 ms  192.168.1.1")
            .unwrap();
        assert_eq!(
            parsed,
            ParsedLine::Hop {
                ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
                hostname: None,
                latency_ms: 1,
            }
        );
    }

    #[test]
    fn test_windows_line_with_hostname() {
        let mut parser = parser_past_headers(HostOs::Windows, true);
        let parsed = parser
            .parse_line("  2    10 ms    12 ms    11 ms  gw.example.net [10.0.0.2]")
            .unwrap();
        assert_eq!(
            parsed,
            ParsedLine::Hop {
                ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                hostname: Some("gw.example.net".to_string()),
                latency_ms: 11,
            }
        );
    }

    #[test]
    fn test_windows_lost_line() {
        let mut parser = parser_past_headers(HostOs::Windows, false);
        let parsed = parser
            .parse_line("  3     *        *        *     Request timed out.")
            .unwrap();
        assert_eq!(parsed, ParsedLine::Lost);
    }

    #[test]
    fn test_unix_ip_only_line() {
        // Reverse lookup enabled but the line carries the address twice:
        // no distinct hostname token, so none is reported.
        let mut parser = parser_past_headers(HostOs::Linux, true);
        let parsed = parser
            .parse_line(" 1  10.0.0.1 (10.0.0.1)  2.345 ms")
            .unwrap();
        assert_eq!(
            parsed,
            ParsedLine::Hop {
                ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                hostname: None,
                latency_ms: 2,
            }
        );
    }

    #[test]
    fn test_unix_hostname_line() {
        let mut parser = parser_past_headers(HostOs::Linux, true);
        let parsed = parser
            .parse_line(" 2  gw.example.net (10.0.0.2)  3.901 ms")
            .unwrap();
        assert_eq!(
            parsed,
            ParsedLine::Hop {
                ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                hostname: Some("gw.example.net".to_string()),
                latency_ms: 3,
            }
        );
    }

    #[test]
    fn test_unix_numeric_line() {
        let mut parser = parser_past_headers(HostOs::Linux, false);
        let parsed = parser.parse_line(" 3  10.0.0.3  1.2 ms").unwrap();
        assert_eq!(
            parsed,
            ParsedLine::Hop {
                ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)),
                hostname: None,
                latency_ms: 1,
            }
        );
    }

    #[test]
    fn test_unix_lost_line() {
        let mut parser = parser_past_headers(HostOs::Linux, false);
        assert_eq!(parser.parse_line(" 4  *").unwrap(), ParsedLine::Lost);
    }

    #[test]
    fn test_header_lines_are_skipped() {
        let mut parser = LineParser::new(HostOs::Windows, false);
        for _ in 0..4 {
            // Even hop-shaped content inside the header block is skipped.
            assert_eq!(
                parser
                    .parse_line("Tracing route to example.com [93.184.216.34]")
                    .unwrap(),
                ParsedLine::Skipped
            );
        }
    }

    #[test]
    fn test_macos_has_no_header() {
        let mut parser = LineParser::new(HostOs::MacOs, false);
        let parsed = parser.parse_line(" 1  10.0.0.1  0.5 ms").unwrap();
        assert!(matches!(parsed, ParsedLine::Hop { .. }));
    }

    #[test]
    fn test_noise_lines_skipped() {
        let mut parser = parser_past_headers(HostOs::Linux, false);
        assert_eq!(
            parser
                .parse_line("Warning: example.com has multiple addresses; using 93.184.216.34")
                .unwrap(),
            ParsedLine::Skipped
        );
        assert_eq!(parser.parse_line("").unwrap(), ParsedLine::Skipped);
    }

    #[test]
    fn test_unparseable_line_is_an_error() {
        let mut parser = parser_past_headers(HostOs::Linux, false);
        assert!(parser.parse_line("complete garbage here").is_err());
    }
}
