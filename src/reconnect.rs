//! Self-recovery and reconnect flow driven by an external failure signal.
//! The service holds no connection state of its own; everything it needs
//! arrives per call, and concurrent invocations for the same connection are
//! expected to be serialized by a caller-held lock.

use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{
    ConnectionMode, CurrentConnection, FailReason, ReconnectEvent, TestOutcome,
};

const STABILIZATION_DELAY: Duration = Duration::from_secs(2);
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Answers whether the machine has internet reachability at all, regardless
/// of the proxy connection under repair.
pub trait NetworkValidator {
    fn check_internet_connection(&self) -> bool;
}

/// Synchronous health probe against an assembled wire config.
pub trait ConnectionTester {
    fn test_connection_sync(&self, config: &Value) -> TestOutcome;
}

/// Receiver for reconnect lifecycle events. Delivery is best-effort; a
/// failing sink never aborts the flow.
pub trait EventSink {
    fn emit(&self, event: &ReconnectEvent) -> Result<()>;
}

pub struct AutoReconnectService {
    network: Box<dyn NetworkValidator>,
    tester: Box<dyn ConnectionTester>,
    events: Box<dyn EventSink>,
    stabilization: Duration,
}

impl AutoReconnectService {
    pub fn new(
        network: Box<dyn NetworkValidator>,
        tester: Box<dyn ConnectionTester>,
        events: Box<dyn EventSink>,
    ) -> Self {
        AutoReconnectService {
            network,
            tester,
            events,
            stabilization: STABILIZATION_DELAY,
        }
    }

    /// Shortens the post-failure debounce. The delay exists to avoid
    /// reconnecting through a transient blip; the decision logic is
    /// unaffected by its length.
    pub fn stabilization(mut self, delay: Duration) -> Self {
        self.stabilization = delay;
        self
    }

    /// Runs one pass of the recovery state machine. Steps execute in fixed
    /// order: failure event, internet check, stabilization wait, self
    /// recovery probe, then reconnect. Returns true when the connection is
    /// healthy at the end, whether recovered or re-established.
    ///
    /// `load_config` reads the wire config the probe should test;
    /// `connect` re-establishes the connection from its file and mode.
    pub fn handle_failure<L, C>(
        &self,
        current: &CurrentConnection,
        load_config: L,
        connect: C,
    ) -> bool
    where
        L: Fn(&Path) -> Option<Value>,
        C: Fn(&Path, ConnectionMode) -> bool,
    {
        self.emit(&ReconnectEvent::FailureDetected);

        if !self.network.check_internet_connection() {
            info!("no internet reachability, skipping reconnect");
            self.emit(&ReconnectEvent::ReconnectFailed {
                reason: FailReason::NoInternet,
            });
            return false;
        }

        std::thread::sleep(self.stabilization);

        // The connection may have healed on its own while we waited; probing
        // first avoids a disruptive restart of a working backend.
        if current.is_file_backed() {
            if let Some(path) = current.file_path.as_deref() {
                if let Some(config) = load_config(path) {
                    let outcome = self.tester.test_connection_sync(&config);
                    if outcome.success {
                        info!(latency_ms = ?outcome.latency_ms, "connection recovered on its own");
                        self.emit(&ReconnectEvent::Reconnected { recovered: true });
                        return true;
                    }
                    debug!(detail = ?outcome.detail, "self-recovery probe failed");
                } else {
                    debug!(path = %path.display(), "could not load config for recovery probe");
                }
            }
        }

        let (path, mode) = match (current.file_path.as_deref(), current.mode) {
            (Some(path), Some(mode)) if current.is_file_backed() => (path, mode),
            _ => {
                warn!("connection is not reconnectable");
                self.emit(&ReconnectEvent::ReconnectFailed {
                    reason: FailReason::InvalidConnection,
                });
                return false;
            }
        };

        self.emit(&ReconnectEvent::Reconnecting);
        if connect(path, mode) {
            info!(path = %path.display(), "reconnected");
            self.emit(&ReconnectEvent::Reconnected { recovered: false });
            true
        } else {
            warn!(path = %path.display(), "reconnect attempt failed");
            self.emit(&ReconnectEvent::ReconnectFailed {
                reason: FailReason::ConnectFailed,
            });
            false
        }
    }

    fn emit(&self, event: &ReconnectEvent) {
        if let Err(e) = self.events.emit(event) {
            warn!(%e, ?event, "failed to emit reconnect event");
        }
    }
}

/// Internet reachability via TCP handshakes against public resolvers. One
/// reachable endpoint is enough.
pub struct TcpNetworkValidator {
    endpoints: Vec<(String, u16)>,
    timeout: Duration,
}

impl Default for TcpNetworkValidator {
    fn default() -> Self {
        TcpNetworkValidator {
            endpoints: vec![
                ("1.1.1.1".to_string(), 53),
                ("8.8.8.8".to_string(), 53),
                ("9.9.9.9".to_string(), 53),
            ],
            timeout: PROBE_TIMEOUT,
        }
    }
}

impl NetworkValidator for TcpNetworkValidator {
    fn check_internet_connection(&self) -> bool {
        self.endpoints
            .iter()
            .any(|(host, port)| tcp_reachable(host, *port, self.timeout))
    }
}

/// Probes the proxy outbound's server endpoint with a plain TCP handshake
/// and reports the handshake latency.
pub struct TcpConnectionTester {
    timeout: Duration,
}

impl Default for TcpConnectionTester {
    fn default() -> Self {
        TcpConnectionTester {
            timeout: PROBE_TIMEOUT,
        }
    }
}

impl ConnectionTester for TcpConnectionTester {
    fn test_connection_sync(&self, config: &Value) -> TestOutcome {
        let Some((address, port)) = probe_target(config) else {
            return TestOutcome {
                success: false,
                latency_ms: None,
                detail: Some("config has no probe-able outbound".to_string()),
            };
        };
        let started = Instant::now();
        if tcp_reachable(&address, port, self.timeout) {
            TestOutcome {
                success: true,
                latency_ms: Some(started.elapsed().as_millis() as u64),
                detail: None,
            }
        } else {
            TestOutcome {
                success: false,
                latency_ms: None,
                detail: Some(format!("{address}:{port} unreachable")),
            }
        }
    }
}

fn tcp_reachable(host: &str, port: u16, timeout: Duration) -> bool {
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    for addr in addrs {
        if TcpStream::connect_timeout(&addr, timeout).is_ok() {
            return true;
        }
    }
    false
}

/// Extracts the server endpoint of the proxy outbound from a wire config.
fn probe_target(config: &Value) -> Option<(String, u16)> {
    let outbounds = config.get("outbounds")?.as_array()?;
    let outbound = outbounds
        .iter()
        .find(|o| o.get("tag").and_then(Value::as_str) == Some("proxy"))
        .or_else(|| outbounds.first())?;
    let settings = outbound.get("settings")?;
    let server = settings
        .get("vnext")
        .or_else(|| settings.get("servers"))?
        .as_array()?
        .first()?;
    let address = server.get("address")?.as_str()?.to_string();
    let port = u16::try_from(server.get("port")?.as_u64()?).ok()?;
    Some((address, port))
}
