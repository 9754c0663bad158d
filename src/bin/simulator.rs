use clap::{App, Arg};
use hvsbus::agent::{AgentError, BrokerAction, EmulatorAgent};
use hvsbus::bus::{Broker, BrokerError, BusError};
use hvsbus::config::EmulatorConfig;
use hvsbus::sim::{SimulatedBus, SimulatedInverter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::time;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_PORT: &str = "8080";
const LOOP_PERIOD_MS: u64 = 10;
const BROADCAST_BUFFER_SIZE: usize = 256;
const AUTO_HEARTBEAT_PERIOD_MS: u64 = 10_000;

/// One line out to bridge clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OutboundLine {
    topic: String,
    payload: String,
    retain: bool,
}

/// One line in from a bridge client.
#[derive(Debug, Clone, Deserialize)]
struct InboundLine {
    topic: String,
    #[serde(default)]
    payload: String,
}

#[derive(Debug, Serialize)]
struct Ack<'a> {
    topic: &'a str,
    #[serde(flatten)]
    action: BrokerAction,
}

/// Broker side of the TCP bridge: publishes fan out to every connected
/// client, retained messages are replayed to new ones.
struct BridgeBroker {
    tx: broadcast::Sender<String>,
    retained: BTreeMap<String, String>,
}

impl BridgeBroker {
    fn new(tx: broadcast::Sender<String>) -> Self {
        Self {
            tx,
            retained: BTreeMap::new(),
        }
    }
}

impl Broker for BridgeBroker {
    fn is_connected(&self) -> bool {
        true
    }

    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), BrokerError> {
        let line = OutboundLine {
            topic: topic.into(),
            payload: payload.into(),
            retain,
        };
        let json = serde_json::to_string(&line).map_err(|e| BrokerError::Publish {
            topic: topic.into(),
            reason: e.to_string(),
        })?;
        if retain {
            self.retained.insert(topic.into(), json.clone());
        }
        // No receivers is fine; nobody is listening yet.
        let _ = self.tx.send(json);
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        // Every client sees every topic; the filter is only logged.
        info!(topic, "subscribed");
        Ok(())
    }
}

struct Simulation {
    agent: EmulatorAgent,
    bus: SimulatedBus,
    inverter: SimulatedInverter,
    broker: BridgeBroker,
    clock: Instant,
    auto_heartbeat: bool,
    last_heartbeat_ms: Option<u64>,
}

impl Simulation {
    fn now_ms(&self) -> u64 {
        self.clock.elapsed().as_millis() as u64
    }

    fn step(&mut self) -> Result<(), AgentError> {
        let now = self.now_ms();
        if self.auto_heartbeat
            && self
                .last_heartbeat_ms
                .is_none_or(|last| now.saturating_sub(last) >= AUTO_HEARTBEAT_PERIOD_MS)
        {
            let topic = self.agent.config().broker.heartbeat_topic.clone();
            self.agent.handle_broker_message(&topic, "1", now);
            self.last_heartbeat_ms = Some(now);
        }
        self.inverter.step(now, &mut self.bus);
        if let Err(e) = self.agent.poll(&mut self.bus, now) {
            self.agent.flush_telemetry(&mut self.broker);
            return Err(e);
        }
        if self.inverter.is_identified() {
            self.bus.clear_sent();
        }
        self.agent.drain_telemetry(&mut self.broker);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = App::new("hvsbus-simulator")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Runs the battery emulator against a simulated inverter and bridges its broker over TCP")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Bridge port")
                .takes_value(true)
                .default_value(DEFAULT_PORT),
        )
        .arg(
            Arg::with_name("inverter")
                .long("inverter")
                .value_name("NAME")
                .help("Name the simulated inverter announces (max 7 bytes)")
                .takes_value(true)
                .default_value("GEN24"),
        )
        .arg(
            Arg::with_name("heartbeat")
                .long("heartbeat")
                .help("Act as the master too and send a heartbeat every 10 seconds"),
        )
        .arg(
            Arg::with_name("fail-bus-init")
                .long("fail-bus-init")
                .help("Pretend the CAN driver failed to start"),
        )
        .get_matches();

    let config = match matches.value_of("config") {
        Some(path) => EmulatorConfig::from_file(path)?,
        None => EmulatorConfig::default(),
    };
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let inverter_name = matches.value_of("inverter").unwrap_or("GEN24");
    let auto_heartbeat = matches.is_present("heartbeat");
    let bus_init = if matches.is_present("fail-bus-init") {
        Err(BusError::NotRunning)
    } else {
        Ok(())
    };

    let (tx, _) = broadcast::channel(BROADCAST_BUFFER_SIZE);

    let mut agent = EmulatorAgent::new(config, 0)?;
    agent.start(bus_init, 0);
    let mut broker = BridgeBroker::new(tx.clone());
    agent.on_broker_connected(&mut broker)?;

    let simulation = Arc::new(Mutex::new(Simulation {
        agent,
        bus: SimulatedBus::new(),
        inverter: SimulatedInverter::new(inverter_name),
        broker,
        clock: Instant::now(),
        auto_heartbeat,
        last_heartbeat_ms: None,
    }));

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!(port, "bridge listening");
    let server = tokio::spawn(accept_loop(listener, Arc::clone(&simulation), tx));

    let mut interval = time::interval(Duration::from_millis(LOOP_PERIOD_MS));
    let outcome = loop {
        tokio::select! {
            _ = interval.tick() => {
                let mut sim = simulation.lock().await;
                if let Err(e) = sim.step() {
                    break Err(e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                break Ok(());
            }
        }
    };

    simulation.lock().await.agent.stop();
    server.abort();

    match outcome {
        Ok(()) => {
            info!("simulator stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "emulator gave up");
            Err(e.into())
        }
    }
}

async fn accept_loop(listener: TcpListener, simulation: Arc<Mutex<Simulation>>, tx: broadcast::Sender<String>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!(%addr, "client connected");
                let simulation = Arc::clone(&simulation);
                let rx = tx.subscribe();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, simulation, rx).await {
                        warn!(%addr, error = %e, "client error");
                    }
                    info!(%addr, "client disconnected");
                });
            }
            Err(e) => error!(error = %e, "failed to accept connection"),
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    simulation: Arc<Mutex<Simulation>>,
    mut rx: broadcast::Receiver<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));

    let retained: Vec<String> = simulation.lock().await.broker.retained.values().cloned().collect();
    {
        let mut w = writer.lock().await;
        for line in retained {
            w.write_all(line.as_bytes()).await?;
            w.write_all(b"\n").await?;
        }
    }

    let out = Arc::clone(&writer);
    let forward = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(line) => {
                    let mut w = out.lock().await;
                    if w.write_all(line.as_bytes()).await.is_err() || w.write_all(b"\n").await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "client lagging, messages skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<InboundLine>(trimmed) {
            Ok(inbound) => {
                let action = {
                    let mut sim = simulation.lock().await;
                    let now = sim.now_ms();
                    sim.agent.handle_broker_message(&inbound.topic, &inbound.payload, now)
                };
                info!(topic = %inbound.topic, ?action, "broker message");
                serde_json::to_string(&Ack {
                    topic: &inbound.topic,
                    action,
                })?
            }
            Err(e) => {
                warn!(error = %e, "unparsable bridge line");
                serde_json::json!({ "error": format!("invalid message: {e}") }).to_string()
            }
        };

        let mut w = writer.lock().await;
        w.write_all(reply.as_bytes()).await?;
        w.write_all(b"\n").await?;
    }

    forward.abort();
    Ok(())
}
