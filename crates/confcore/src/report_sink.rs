use std::net::{SocketAddr, UdpSocket};

/// Sends a single fixed-form "report on load" datagram. Disabled by default;
/// the real DNS wire encoding is deliberately minimal — just enough of the
/// `<hostname>.<version>.<type>.<suffix>` label contract (§6) to be testable
/// without pulling in a full DNS codec, which is out of scope (§1 Non-goals).
pub trait ReportSink: Send + Sync {
    fn report(&self, hostname: &str, version: u32, conf_type: &str);
}

/// Default sink: report-on-load is a no-op unless a server address was
/// configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReportSink;

impl ReportSink for NullReportSink {
    fn report(&self, _hostname: &str, _version: u32, _conf_type: &str) {}
}

/// Builds a fixed-suffix label of the form `<hostname>.<version>.<type>.conf-report`
/// and ships it as a UDP datagram's payload (query-name bytes, not a fully
/// encoded DNS message — the original sends a real "type NULL, class IN"
/// query; forming the question section is enough to exercise this path).
pub struct UdpReportSink {
    socket: UdpSocket,
    server: SocketAddr,
    suffix: String,
}

const DEFAULT_SUFFIX: &str = "conf-report";

impl UdpReportSink {
    pub fn new(server: SocketAddr) -> std::io::Result<UdpReportSink> {
        let bind_addr = if server.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind_addr)?;
        Ok(UdpReportSink { socket, server, suffix: DEFAULT_SUFFIX.to_owned() })
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> UdpReportSink {
        self.suffix = suffix.into();
        self
    }
}

impl ReportSink for UdpReportSink {
    fn report(&self, hostname: &str, version: u32, conf_type: &str) {
        let label = format!("{}.{}.{}.{}", hostname, version, conf_type, self.suffix);
        if let Err(e) = self.socket.send_to(label.as_bytes(), self.server) {
            log::warn!("report-on-load to {} failed: {}", self.server, e);
        }
    }
}
