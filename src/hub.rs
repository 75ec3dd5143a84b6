//! Process root
//!
//! [`SerialHub`] owns the broadcaster, the connection registry and the port
//! catalog, and is the single place where a port is opened or closed. Client
//! commands enter through [`SerialHub::handle_command`]; every failure is
//! broadcast back to clients.

use serialhub_core::{
    BroadcastHub, Broadcaster, Error, OutboundMessage, Result, SerialError,
};
use serialhub_serial::{
    BufferAlgorithm, ConnectionRegistry, DiscoveryProcess, PortCatalog, PortOpener, SendMode,
    SerialConnection, SerialPortOpener,
};
use serialhub_settings::AgentConfig;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::commands::{HubCommand, SendJsonRequest};

pub struct SerialHub {
    config: Arc<AgentConfig>,
    broadcaster: Arc<BroadcastHub>,
    registry: Arc<ConnectionRegistry>,
    catalog: Arc<PortCatalog>,
    opener: Arc<dyn PortOpener>,
}

impl SerialHub {
    pub fn new(config: AgentConfig, opener: Arc<dyn PortOpener>) -> Result<Self> {
        let exclude = config
            .discovery
            .exclude_regex()
            .map_err(|e| Error::other(e.to_string()))?;
        let broadcaster = Arc::new(BroadcastHub::new(config.hub.broadcast_capacity));
        let shared: Arc<dyn Broadcaster> = broadcaster.clone();
        Ok(Self {
            registry: Arc::new(ConnectionRegistry::new(shared.clone())),
            catalog: Arc::new(PortCatalog::new(exclude, shared)),
            config: Arc::new(config),
            broadcaster,
            opener,
        })
    }

    /// Hub backed by real serial hardware
    pub fn with_serial_ports(config: AgentConfig) -> Result<Self> {
        let opener = Arc::new(SerialPortOpener::new(config.serial.read_timeout()));
        Self::new(config, opener)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn broadcaster(&self) -> &Arc<BroadcastHub> {
        &self.broadcaster
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.broadcaster.subscribe()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<PortCatalog> {
        &self.catalog
    }

    fn default_algorithm(&self) -> BufferAlgorithm {
        self.config
            .serial
            .default_algorithm
            .parse()
            .unwrap_or(BufferAlgorithm::Default)
    }

    /// Open `port` and start serving it.
    ///
    /// A failure to open is broadcast as `OpenFail`. Once the reader stops,
    /// for any reason, the connection is unregistered and the port list
    /// re-broadcast.
    pub async fn open(
        &self,
        port: &str,
        baud: u32,
        algorithm: BufferAlgorithm,
    ) -> Result<Arc<SerialConnection>> {
        if self.registry.contains(port) {
            return Err(SerialError::PortAlreadyOpen {
                port: port.to_string(),
            }
            .into());
        }
        tracing::info!("Opening serial port {} at {} baud", port, baud);

        let opener = self.opener.clone();
        let name = port.to_string();
        let opened = tokio::task::spawn_blocking(move || opener.open(&name, baud))
            .await
            .map_err(|e| Error::other(format!("Open task for {} failed: {}", port, e)))?;
        let io = match opened {
            Ok(io) => io,
            Err(e) => {
                tracing::warn!("Error opening port {}: {}", port, e);
                self.broadcaster
                    .broadcast(OutboundMessage::open_fail(port, baud, e.to_string()));
                return Err(e.into());
            }
        };

        let conn = SerialConnection::start(
            port,
            baud,
            algorithm,
            io,
            self.broadcaster.clone(),
            self.config.clone(),
        );
        if let Err(e) = self.registry.register(conn.clone()) {
            conn.shutdown_writers().await;
            return Err(e.into());
        }
        self.catalog.mark_open(port, baud, algorithm);
        self.catalog.broadcast_list();

        let reader = conn.spawn_reader();
        let registry = self.registry.clone();
        let catalog = self.catalog.clone();
        let supervised = conn.clone();
        tokio::spawn(async move {
            if let Err(e) = reader.await {
                tracing::error!("Reader for {} failed: {}", supervised.name(), e);
            }
            if registry.unregister(&supervised).await {
                catalog.mark_closed(supervised.name());
                catalog.broadcast_list();
            }
        });

        Ok(conn)
    }

    /// Close `port` and wait until its writers have stopped
    pub async fn close(&self, port: &str) -> Result<()> {
        let conn = self.find(port)?;
        conn.close();
        conn.wait_closed().await;
        Ok(())
    }

    pub async fn write(&self, port: &str, data: &str, mode: SendMode) -> Result<()> {
        let conn = self.find(port)?;
        conn.write(data, mode).await?;
        Ok(())
    }

    /// Send each command of a `sendjson` request paced, with its id
    pub async fn send_json(&self, request: &SendJsonRequest) -> Result<()> {
        let conn = self.find(&request.port)?;
        for cmd in &request.data {
            conn.send_paced(&cmd.data, &cmd.id).await?;
        }
        Ok(())
    }

    pub fn list(&self) {
        self.catalog.broadcast_list();
    }

    pub fn version(&self) {
        self.broadcaster
            .broadcast(OutboundMessage::Version(crate::version_string()));
    }

    fn find(&self, port: &str) -> Result<Arc<SerialConnection>> {
        self.registry.find(port).ok_or_else(|| {
            SerialError::PortNotFound {
                port: port.to_string(),
            }
            .into()
        })
    }

    pub async fn execute(&self, command: HubCommand) -> Result<()> {
        tracing::debug!("Executing {:?}", command);
        match command {
            HubCommand::List => self.list(),
            HubCommand::Version => self.version(),
            HubCommand::Open {
                port,
                baud,
                algorithm,
            } => {
                let algorithm = algorithm.unwrap_or_else(|| self.default_algorithm());
                self.open(&port, baud, algorithm).await?;
            }
            HubCommand::Close { port } => self.close(&port).await?,
            HubCommand::Send { mode, port, data } => self.write(&port, &data, mode).await?,
            HubCommand::SendJson(request) => self.send_json(&request).await?,
        }
        Ok(())
    }

    /// Parse and run one client command line, broadcasting any failure
    pub async fn handle_command(&self, line: &str) {
        let result = match line.parse::<HubCommand>() {
            Ok(command) => self.execute(command).await,
            Err(serialhub_core::CommandError::Empty) => return,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(()) => {}
            // already reported as OpenFail
            Err(Error::Serial(SerialError::OpenFailed { .. })) => {}
            Err(e) => {
                tracing::warn!("Command {:?} failed: {}", line.trim_end(), e);
                self.broadcaster
                    .broadcast(OutboundMessage::error(e.to_string()));
            }
        }
    }

    /// Feed the catalog from the configured discovery binary until its
    /// restart budget runs out
    pub async fn run_discovery(&self) {
        let settings = &self.config.discovery;
        let source = DiscoveryProcess::new(settings.program.clone(), settings.args.clone());
        self.catalog
            .run(&source, settings.max_restarts, settings.restart_backoff())
            .await;
    }

    /// Close every open connection
    pub async fn shutdown(&self) {
        let open = self.registry.all();
        tracing::info!("Shutting down {} open connections", open.len());
        for conn in open {
            conn.close();
            conn.wait_closed().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serialhub_serial::PortIo;
    use std::collections::HashMap;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakePort {
        writes: Mutex<Vec<Vec<u8>>>,
        closed: AtomicBool,
    }

    impl FakePort {
        fn written_text(&self) -> String {
            self.writes
                .lock()
                .iter()
                .map(|w| String::from_utf8_lossy(w).into_owned())
                .collect()
        }
    }

    impl PortIo for FakePort {
        fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(io::ErrorKind::NotConnected.into());
            }
            std::thread::sleep(Duration::from_millis(2));
            Err(io::ErrorKind::TimedOut.into())
        }

        fn write(&self, data: &[u8]) -> io::Result<()> {
            self.writes.lock().push(data.to_vec());
            Ok(())
        }

        fn close(&self) -> io::Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Opens only the ports it was built with
    #[derive(Default)]
    struct FakeOpener {
        ports: Mutex<HashMap<String, Arc<FakePort>>>,
    }

    impl FakeOpener {
        fn with_port(name: &str) -> (Arc<Self>, Arc<FakePort>) {
            let opener = Arc::new(Self::default());
            let port = Arc::new(FakePort::default());
            opener.ports.lock().insert(name.to_string(), port.clone());
            (opener, port)
        }
    }

    impl PortOpener for FakeOpener {
        fn open(&self, name: &str, _baud: u32) -> std::result::Result<Arc<dyn PortIo>, SerialError> {
            match self.ports.lock().get(name) {
                Some(port) => Ok(port.clone()),
                None => Err(SerialError::OpenFailed {
                    port: name.to_string(),
                    reason: "no such file or directory".to_string(),
                }),
            }
        }
    }

    struct Harness {
        hub: SerialHub,
        port: Arc<FakePort>,
        messages: Arc<Mutex<Vec<OutboundMessage>>>,
    }

    impl Harness {
        fn new() -> Self {
            let mut config = AgentConfig::default();
            config.grbl.status_poll_interval_ms = 60_000;
            let (opener, port) = FakeOpener::with_port("COM3");
            let hub = SerialHub::new(config, opener).unwrap();
            let messages = Arc::new(Mutex::new(Vec::new()));
            {
                let messages = messages.clone();
                hub.broadcaster()
                    .add_handler(move |m| messages.lock().push(m.clone()));
            }
            Self {
                hub,
                port,
                messages,
            }
        }

        fn errors(&self) -> Vec<String> {
            self.messages
                .lock()
                .iter()
                .filter_map(|m| match m {
                    OutboundMessage::Error(e) => Some(e.clone()),
                    _ => None,
                })
                .collect()
        }

        fn count(&self, pred: impl Fn(&OutboundMessage) -> bool) -> usize {
            self.messages.lock().iter().filter(|m| pred(m)).count()
        }
    }

    async fn eventually(cond: impl Fn() -> bool) -> bool {
        for _ in 0..400 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cond()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn open_send_close_round_trip() {
        let h = Harness::new();

        h.hub.handle_command("open COM3 115200 grbl\n").await;
        assert!(h.hub.registry().contains("com3"));
        assert_eq!(
            h.count(|m| matches!(
                m,
                OutboundMessage::Lifecycle(l) if l.cmd == "Open" && l.buffer_type.as_deref() == Some("grbl")
            )),
            1
        );
        assert!(h.count(|m| matches!(m, OutboundMessage::Ports(_))) >= 1);

        h.hub.handle_command("send COM3 G0 X1 ; rapid\nG1 Y2\n").await;
        h.hub
            .handle_command(r#"sendjson {"P":"COM3","Data":[{"D":"M3 S1000\n","Id":"9"}]}"#)
            .await;
        assert!(eventually(|| h.port.written_text() == "G0X1\nG1Y2\nM3S1000\n").await);

        h.hub.handle_command("close COM3").await;
        assert!(h.hub.registry().is_empty());
        assert_eq!(
            h.count(|m| matches!(m, OutboundMessage::Lifecycle(l) if l.cmd == "Close")),
            1
        );
        assert!(h.errors().is_empty(), "unexpected errors {:?}", h.errors());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn open_failure_is_broadcast_once() {
        let h = Harness::new();
        h.hub.handle_command("open COM9 9600").await;

        assert_eq!(
            h.count(|m| matches!(
                m,
                OutboundMessage::OpenFail(o) if o.port == "COM9" && o.desc.starts_with("Error opening port.")
            )),
            1
        );
        assert!(h.errors().is_empty());
        assert!(h.hub.registry().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_open_is_rejected() {
        let h = Harness::new();
        let conn = h.hub.open("COM3", 115200, BufferAlgorithm::Default).await.unwrap();
        h.hub.handle_command("open com3 115200").await;

        assert_eq!(h.errors(), vec!["Port already open: com3".to_string()]);
        assert_eq!(h.hub.registry().len(), 1);
        assert_eq!(conn.algorithm(), BufferAlgorithm::Default);
        h.hub.shutdown().await;
        assert!(h.hub.registry().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bad_commands_become_error_messages() {
        let h = Harness::new();
        h.hub.handle_command("send COM7 G0\n").await;
        h.hub.handle_command("frobnicate").await;
        h.hub.handle_command("open COM3 fast").await;
        h.hub.handle_command("").await;

        assert_eq!(
            h.errors(),
            vec![
                "We could not find the serial port COM7 that you were trying to use.".to_string(),
                "Could not understand command.".to_string(),
                "Problem converting baud rate fast".to_string(),
            ]
        );
        let wire = OutboundMessage::error("Could not understand command.").to_wire();
        assert_eq!(wire, r#"{"Error":"Could not understand command."}"#);
    }

    #[tokio::test]
    async fn version_and_list() {
        let h = Harness::new();
        h.hub.handle_command("version").await;
        h.hub.handle_command("list").await;

        let messages = h.messages.lock().clone();
        assert!(matches!(&messages[0], OutboundMessage::Version(v) if v.starts_with(crate::VERSION)));
        assert!(matches!(&messages[1], OutboundMessage::Ports(p) if p.ports.is_empty()));
    }
}
