//! OS traceroute process probe.
//!
//! Spawns the platform traceroute utility and incrementally parses its
//! stdout into hops. The stream is consumed as raw bytes rather than
//! buffered lines because end-of-stream semantics differ per platform:
//! Windows must end with an explicit "Trace complete" terminator, while
//! Unix and macOS treat plain EOF as normal completion.

pub mod parser;
pub mod platform;

pub use parser::{LineParser, ParsedLine};

use async_trait::async_trait;
use geotrace_core::{
    CancellationMonitor, HopSink, HostOs, ProbeOutcome, ProbeStrategy, TraceError,
};
use parser::ParsedLine as Line;
use std::net::IpAddr;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

/// Probe strategy that wraps the platform traceroute command.
pub struct OsProcessProbe {
    os: HostOs,
    destination: String,
    destination_ip: IpAddr,
    max_hops: u8,
    resolve_hostname: bool,
    ipv4: bool,
    command_override: Option<(String, Vec<String>)>,
}

#[derive(Default)]
struct StreamEnd {
    cancelled: bool,
    saw_terminator: bool,
    hop_count: u32,
    last_ip: Option<IpAddr>,
}

impl OsProcessProbe {
    pub fn new(
        os: HostOs,
        destination: String,
        destination_ip: IpAddr,
        max_hops: u8,
        resolve_hostname: bool,
        ipv4: bool,
    ) -> Self {
        Self {
            os,
            destination,
            destination_ip,
            max_hops,
            resolve_hostname,
            ipv4,
            command_override: None,
        }
    }

    /// Replaces the spawned command. The output is still parsed with this
    /// probe's platform rules; intended for tests and embedding.
    pub fn with_command(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.command_override = Some((program.into(), args));
        self
    }

    fn command_line(&self) -> (String, Vec<String>) {
        match &self.command_override {
            Some((program, args)) => (program.clone(), args.clone()),
            None => platform::command(
                self.os,
                &self.destination,
                self.max_hops,
                self.resolve_hostname,
                self.ipv4,
            ),
        }
    }

    async fn consume_stdout(
        &self,
        stdout: &mut ChildStdout,
        sink: &dyn HopSink,
        monitor: &CancellationMonitor,
    ) -> Result<StreamEnd, TraceError> {
        let mut line_parser = LineParser::new(self.os, self.resolve_hostname);
        let mut pending = String::new();
        let mut buf = [0u8; 4096];
        let mut end = StreamEnd::default();

        loop {
            tokio::select! {
                _ = monitor.cancelled() => {
                    end.cancelled = true;
                    return Ok(end);
                }
                read = stdout.read(&mut buf) => {
                    let n = read.map_err(TraceError::ProbeIo)?;
                    if n == 0 {
                        let trailing = std::mem::take(&mut pending);
                        if !trailing.trim().is_empty() {
                            self.handle_line(&trailing, &mut line_parser, sink, &mut end)
                                .await?;
                        }
                        return Ok(end);
                    }
                    pending.push_str(&String::from_utf8_lossy(&buf[..n]));
                    while let Some(pos) = pending.find('\n') {
                        let line: String = pending.drain(..=pos).collect();
                        let line = line.trim_end_matches(['\r', '\n']);
                        self.handle_line(line, &mut line_parser, sink, &mut end).await?;
                    }
                }
            }
        }
    }

    async fn handle_line(
        &self,
        line: &str,
        line_parser: &mut LineParser,
        sink: &dyn HopSink,
        end: &mut StreamEnd,
    ) -> Result<(), TraceError> {
        if line.contains("Trace complete") {
            end.saw_terminator = true;
            return Ok(());
        }

        match line_parser.parse_line(line)? {
            Line::Hop {
                ip,
                hostname,
                latency_ms,
            } => {
                sink.add_point(ip, hostname, latency_ms, None).await;
                end.hop_count += 1;
                end.last_ip = Some(ip);
            }
            Line::Lost => {
                sink.add_unknown_point().await;
                end.hop_count += 1;
            }
            Line::Skipped => {}
        }
        Ok(())
    }

    /// Force-terminates the child; runs on every exit path.
    async fn teardown(child: &mut Child) {
        if let Err(e) = child.kill().await {
            debug!(error = %e, "Traceroute process already gone");
        }
        let _ = child.wait().await;
    }
}

#[async_trait]
impl ProbeStrategy for OsProcessProbe {
    async fn run(
        &mut self,
        sink: &dyn HopSink,
        monitor: &CancellationMonitor,
    ) -> Result<ProbeOutcome, TraceError> {
        let (program, args) = self.command_line();
        debug!(program = %program, ?args, "Spawning traceroute");

        let mut child = Command::new(&program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TraceError::SpawnFailed {
                command: program.clone(),
                source: e,
            })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| TraceError::Internal("Child stdout not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| TraceError::Internal("Child stderr not captured".to_string()))?;

        let end = match self.consume_stdout(&mut stdout, sink, monitor).await {
            Ok(end) => end,
            Err(e) => {
                Self::teardown(&mut child).await;
                return Err(e);
            }
        };

        if end.cancelled {
            Self::teardown(&mut child).await;
            return Ok(ProbeOutcome::Cancelled);
        }

        if platform::requires_terminator(self.os) && !end.saw_terminator {
            Self::teardown(&mut child).await;
            return Err(TraceError::TruncatedOutput);
        }

        // The stream has ended; anything unexpected on stderr is fatal.
        let mut err_text = String::new();
        if let Err(e) = stderr.read_to_string(&mut err_text).await {
            Self::teardown(&mut child).await;
            return Err(TraceError::ProbeIo(e));
        }
        Self::teardown(&mut child).await;

        if !platform::is_benign_stderr(&err_text) {
            warn!(stderr = %err_text.trim(), "Traceroute wrote to stderr");
            return Err(TraceError::NonBenignStderr(err_text.trim().to_string()));
        }

        // Hop budget exhausted without the destination answering last.
        if end.hop_count >= self.max_hops as u32 && end.last_ip != Some(self.destination_ip) {
            return Ok(ProbeOutcome::MaxHopsExceeded);
        }

        Ok(ProbeOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geotrace_core::{GeoPoint, Hop};
    use parking_lot::Mutex;
    use std::net::Ipv4Addr;

    #[derive(Default)]
    struct RecordingSink {
        hops: Mutex<Vec<Hop>>,
    }

    #[async_trait]
    impl HopSink for RecordingSink {
        async fn add_point(
            &self,
            ip: IpAddr,
            hostname: Option<String>,
            latency_ms: u32,
            dns_lookup_ms: Option<u32>,
        ) -> Hop {
            let mut hops = self.hops.lock();
            let hop = Hop {
                number: hops.len() as u32 + 1,
                ip,
                hostname,
                latency_ms,
                dns_lookup_ms,
                distance_to_previous_km: 0.0,
                geo: GeoPoint::unresolved(),
                synthetic_unknown: false,
            };
            hops.push(hop.clone());
            hop
        }

        async fn add_unknown_point(&self) -> Hop {
            let mut hops = self.hops.lock();
            let previous = hops.last().cloned();
            let hop = Hop {
                number: hops.len() as u32 + 1,
                ip: previous
                    .as_ref()
                    .map(|h| h.ip)
                    .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
                hostname: None,
                latency_ms: 0,
                dns_lookup_ms: None,
                distance_to_previous_km: 0.0,
                geo: previous
                    .map(|h| h.geo)
                    .unwrap_or_else(GeoPoint::unresolved),
                synthetic_unknown: true,
            };
            hops.push(hop.clone());
            hop
        }
    }

    fn probe_for_script(script: &str, destination_ip: IpAddr, max_hops: u8) -> OsProcessProbe {
        OsProcessProbe::new(
            HostOs::Linux,
            "example.com".to_string(),
            destination_ip,
            max_hops,
            false,
            true,
        )
        .with_command("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_output_becomes_hops() {
        let script = "\
echo 'traceroute to example.com (10.0.0.2), 30 hops max'; \
echo ' 1  192.168.1.1  0.5 ms'; \
echo ' 2  10.0.0.2  2.345 ms'";
        let dest = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let mut probe = probe_for_script(script, dest, 30);
        let sink = RecordingSink::default();
        let monitor = CancellationMonitor::new();

        let outcome = probe.run(&sink, &monitor).await.unwrap();
        assert_eq!(outcome, ProbeOutcome::Completed);

        let hops = sink.hops.lock();
        assert_eq!(hops.len(), 2);
        assert_eq!(hops[0].ip, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(hops[1].ip, dest);
        assert_eq!(hops[1].latency_ms, 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lost_probe_clones_previous_geo() {
        let script = "\
echo 'traceroute to example.com (10.0.0.9), 30 hops max'; \
echo ' 1  192.168.1.1  0.5 ms'; \
echo ' 2  *'; \
echo ' 3  10.0.0.9  4.0 ms'";
        let dest = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));
        let mut probe = probe_for_script(script, dest, 30);
        let sink = RecordingSink::default();
        let monitor = CancellationMonitor::new();

        let outcome = probe.run(&sink, &monitor).await.unwrap();
        assert_eq!(outcome, ProbeOutcome::Completed);

        let hops = sink.hops.lock();
        assert_eq!(hops.len(), 3);
        assert!(hops[1].synthetic_unknown);
        assert_eq!(hops[1].latency_ms, 0);
        assert_eq!(hops[1].ip, hops[0].ip);
        assert_eq!(hops[1].geo, hops[0].geo);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_max_hops_heuristic() {
        // Budget of 2 hops, and the last line is not the destination.
        let script = "\
echo 'traceroute to example.com (10.9.9.9), 2 hops max'; \
echo ' 1  192.168.1.1  0.5 ms'; \
echo ' 2  10.0.0.2  2.0 ms'";
        let dest = IpAddr::V4(Ipv4Addr::new(10, 9, 9, 9));
        let mut probe = probe_for_script(script, dest, 2);
        let sink = RecordingSink::default();
        let monitor = CancellationMonitor::new();

        let outcome = probe.run(&sink, &monitor).await.unwrap();
        assert_eq!(outcome, ProbeOutcome::MaxHopsExceeded);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_benign_stderr_is_fatal() {
        let script = "echo 'header'; echo 'traceroute: unknown host' >&2";
        let dest = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let mut probe = probe_for_script(script, dest, 30);
        let sink = RecordingSink::default();
        let monitor = CancellationMonitor::new();

        let err = probe.run(&sink, &monitor).await.unwrap_err();
        assert!(matches!(err, TraceError::NonBenignStderr(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_benign_stderr_banner_is_tolerated() {
        let script = "\
echo 'header'; \
echo 'traceroute to example.com (10.0.0.1), 30 hops max' >&2; \
echo ' 1  10.0.0.1  0.5 ms'";
        let dest = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let mut probe = probe_for_script(script, dest, 30);
        let sink = RecordingSink::default();
        let monitor = CancellationMonitor::new();

        let outcome = probe.run(&sink, &monitor).await.unwrap();
        assert_eq!(outcome, ProbeOutcome::Completed);
        assert_eq!(sink.hops.lock().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_windows_terminator_is_fatal() {
        // Windows semantics: EOF without "Trace complete" is an error.
        let script = "\
echo 'h1'; echo 'h2'; echo 'h3'; echo 'h4'; \
echo '  1    <1 ms    <1 ms    <1 ms  192.168.1.1'";
        let mut probe = OsProcessProbe::new(
            HostOs::Windows,
            "example.com".to_string(),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
            30,
            false,
            true,
        )
        .with_command("sh", vec!["-c".to_string(), script.to_string()]);
        let sink = RecordingSink::default();
        let monitor = CancellationMonitor::new();

        let err = probe.run(&sink, &monitor).await.unwrap_err();
        assert!(matches!(err, TraceError::TruncatedOutput));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_windows_terminator_completes() {
        let script = "\
echo 'h1'; echo 'h2'; echo 'h3'; echo 'h4'; \
echo '  1    <1 ms    <1 ms    <1 ms  192.168.1.1'; \
echo 'Trace complete.'";
        let mut probe = OsProcessProbe::new(
            HostOs::Windows,
            "example.com".to_string(),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
            30,
            false,
            true,
        )
        .with_command("sh", vec!["-c".to_string(), script.to_string()]);
        let sink = RecordingSink::default();
        let monitor = CancellationMonitor::new();

        let outcome = probe.run(&sink, &monitor).await.unwrap();
        assert_eq!(outcome, ProbeOutcome::Completed);
        assert_eq!(sink.hops.lock().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancelled_before_output() {
        let script = "sleep 5; echo ' 1  10.0.0.1  0.5 ms'";
        let dest = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let mut probe = probe_for_script(script, dest, 30);
        let sink = RecordingSink::default();
        let monitor = CancellationMonitor::new();
        monitor.cancel();

        let outcome = probe.run(&sink, &monitor).await.unwrap();
        assert_eq!(outcome, ProbeOutcome::Cancelled);
        assert!(sink.hops.lock().is_empty());
    }
}
