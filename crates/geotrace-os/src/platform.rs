//! Per-platform traceroute command and output-format tables.

use geotrace_core::HostOs;

/// Builds the traceroute command line for a platform.
///
/// Windows: `tracert [-d] [-6] -h <max_hops> <dest>`.
/// Unix:    `traceroute[6] -q 1 [-n] -m <max_hops> <dest>`.
pub fn command(
    os: HostOs,
    destination: &str,
    max_hops: u8,
    resolve_hostname: bool,
    ipv4: bool,
) -> (String, Vec<String>) {
    match os {
        HostOs::Windows => {
            let mut args = Vec::new();
            if !resolve_hostname {
                args.push("-d".to_string());
            }
            if !ipv4 {
                args.push("-6".to_string());
            }
            args.push("-h".to_string());
            args.push(max_hops.to_string());
            args.push(destination.to_string());
            ("tracert".to_string(), args)
        }
        HostOs::Linux | HostOs::MacOs => {
            let program = if ipv4 { "traceroute" } else { "traceroute6" };
            let mut args = vec!["-q".to_string(), "1".to_string()];
            if !resolve_hostname {
                args.push("-n".to_string());
            }
            args.push("-m".to_string());
            args.push(max_hops.to_string());
            args.push(destination.to_string());
            (program.to_string(), args)
        }
    }
}

/// Number of stdout header lines emitted before the first hop line.
pub fn header_lines(os: HostOs) -> usize {
    match os {
        HostOs::Windows => 4,
        HostOs::Linux => 1,
        HostOs::MacOs => 0,
    }
}

/// Number of per-probe timing columns in a hop line.
pub fn timing_columns(os: HostOs) -> usize {
    match os {
        HostOs::Windows => 3,
        HostOs::Linux | HostOs::MacOs => 1,
    }
}

/// Windows requires an explicit "Trace complete" terminator; a plain EOF
/// is an error there. Unix and macOS treat EOF as normal completion.
pub fn requires_terminator(os: HostOs) -> bool {
    os == HostOs::Windows
}

/// Whether the process's stderr output is informational rather than a
/// failure. The traceroute banner and the multiple-addresses warning are
/// the only expected stderr chatter.
pub fn is_benign_stderr(text: &str) -> bool {
    text.lines().all(|line| {
        let line = line.trim();
        line.is_empty()
            || line.starts_with("traceroute to ")
            || line.starts_with("traceroute6 to ")
            || line.to_ascii_lowercase().contains("multiple addresses")
    })
}
