//! Rádio, sensor e energia simulados em memória.
//!
//! [`SimNetwork`] liga vários [`TopologyManager`] por um meio compartilhado:
//! broadcast chega a quem está ao alcance, unicast para quem não está falha
//! como falharia o ACK do rádio. A entrega é síncrona via
//! [`SimNetwork::pump`], então os testes controlam a ordem dos eventos.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Timings;
use crate::lock;
use crate::protocol::{Packet, PacketKind, decode_packet, encode_node_state, encode_temperature};
use crate::radio::{SendMode, SleepManager, TemperatureSensor, TransmitError, Transmitter};
use crate::topology::{Collaborators, TopologyManager};
use crate::types::{Address, DEFAULT_THRESHOLD, NodeState, Role, Temperature, now_millis};

/// Limite de entregas por `pump`, para uma troca sem fim não travar o teste.
const MAX_DELIVERIES: usize = 10_000;

/// Temporizações longas: nenhuma tarefa de fundo dispara durante um teste.
pub fn slow_timings() -> Timings {
    let hour = Duration::from_secs(3600);
    Timings {
        sample_interval: hour,
        window: hour,
        start_delay_per_hop: hour,
        ping_interval: hour,
        relink_interval: hour,
        lost_limit: 5,
        default_threshold: DEFAULT_THRESHOLD,
    }
}

// ──────────────────────────────────────────────
// Rádio
// ──────────────────────────────────────────────

/// Um pacote enviado com sucesso.
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub mode: SendMode,
    pub kind: PacketKind,
    pub destination: Option<Address>,
    pub frame: Vec<u8>,
}

impl SentPacket {
    pub fn packet(&self) -> Packet {
        decode_packet(&self.frame).expect("frame gerado pelo próprio encoder")
    }
}

#[derive(Debug)]
struct Delivery {
    mode: SendMode,
    from: Address,
    to: Address,
    frame: Vec<u8>,
}

/// Meio de rádio compartilhado: enlaces e fila de entrega.
#[derive(Debug, Default)]
pub struct SimMedium {
    links: Mutex<BTreeSet<(Address, Address)>>,
    queue: Mutex<VecDeque<Delivery>>,
}

impl SimMedium {
    fn key(a: &str, b: &str) -> (Address, Address) {
        if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }

    pub fn in_range(&self, a: &str, b: &str) -> bool {
        lock(&self.links).contains(&Self::key(a, b))
    }

    fn neighbors_of(&self, address: &str) -> Vec<Address> {
        lock(&self.links)
            .iter()
            .filter_map(|(a, b)| {
                if a == address {
                    Some(b.clone())
                } else if b == address {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    fn enqueue(&self, delivery: Delivery) {
        lock(&self.queue).push_back(delivery);
    }

    fn next(&self) -> Option<Delivery> {
        lock(&self.queue).pop_front()
    }
}

/// Transmissor em memória que grava tudo o que envia.
#[derive(Debug)]
pub struct SimTransmitter {
    address: Address,
    medium: Option<Arc<SimMedium>>,
    log: Mutex<Vec<SentPacket>>,
    unreachable: Mutex<BTreeSet<Address>>,
    offline: AtomicBool,
}

impl SimTransmitter {
    /// Transmissor sem meio: só grava.
    pub fn standalone(address: &str) -> Arc<Self> {
        Self::build(address, None)
    }

    pub fn connected(address: &str, medium: Arc<SimMedium>) -> Arc<Self> {
        Self::build(address, Some(medium))
    }

    fn build(address: &str, medium: Option<Arc<SimMedium>>) -> Arc<Self> {
        Arc::new(Self {
            address: address.to_string(),
            medium,
            log: Mutex::new(Vec::new()),
            unreachable: Mutex::new(BTreeSet::new()),
            offline: AtomicBool::new(false),
        })
    }

    pub fn sent(&self) -> Vec<SentPacket> {
        lock(&self.log).clone()
    }

    pub fn sent_kind(&self, kind: PacketKind) -> Vec<SentPacket> {
        lock(&self.log)
            .iter()
            .filter(|p| p.kind == kind)
            .cloned()
            .collect()
    }

    /// TEMPs enviados para `destination`.
    pub fn temperatures_to(&self, destination: &str) -> Vec<Temperature> {
        lock(&self.log)
            .iter()
            .filter(|p| p.destination.as_deref() == Some(destination))
            .filter_map(|p| match p.packet() {
                Packet::Temperature(t) => Some(t),
                Packet::State { .. } => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.log).clear();
    }

    /// Unicast para `address` passa a falhar.
    pub fn fail_unicast_to(&self, address: &str) {
        lock(&self.unreachable).insert(address.to_string());
    }

    /// Desliga (ou religa) o rádio inteiro.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn dispatch(
        &self,
        mode: SendMode,
        kind: PacketKind,
        frame: Vec<u8>,
        destination: Option<&str>,
    ) -> Result<(), TransmitError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "rádio desligado").into());
        }

        match mode {
            SendMode::Broadcast => {
                if let Some(medium) = &self.medium {
                    for to in medium.neighbors_of(&self.address) {
                        medium.enqueue(Delivery {
                            mode,
                            from: self.address.clone(),
                            to,
                            frame: frame.clone(),
                        });
                    }
                }
            }
            SendMode::Unicast => {
                let to = destination.ok_or(TransmitError::MissingDestination(kind))?;
                let out_of_range = self
                    .medium
                    .as_ref()
                    .is_some_and(|medium| !medium.in_range(&self.address, to));
                if out_of_range || lock(&self.unreachable).contains(to) {
                    return Err(io::Error::new(
                        io::ErrorKind::HostUnreachable,
                        format!("{to} fora de alcance"),
                    )
                    .into());
                }
                if let Some(medium) = &self.medium {
                    medium.enqueue(Delivery {
                        mode,
                        from: self.address.clone(),
                        to: to.to_string(),
                        frame: frame.clone(),
                    });
                }
            }
        }

        lock(&self.log).push(SentPacket {
            mode,
            kind,
            destination: destination.map(str::to_string),
            frame,
        });
        Ok(())
    }
}

impl Transmitter for SimTransmitter {
    fn send(
        &self,
        mode: SendMode,
        kind: PacketKind,
        state: &NodeState,
        destination: Option<&str>,
    ) -> Result<(), TransmitError> {
        let frame = encode_node_state(kind, state)?;
        let destination = match mode {
            SendMode::Broadcast => None,
            SendMode::Unicast => destination,
        };
        self.dispatch(mode, kind, frame, destination)
    }

    fn send_temperature(&self, destination: &str, value: f64, weight: u32) -> Result<(), TransmitError> {
        let frame = encode_temperature(&Temperature::new(now_millis(), value, weight))?;
        self.dispatch(SendMode::Unicast, PacketKind::Temp, frame, Some(destination))
    }
}

// ──────────────────────────────────────────────
// Sensor e energia
// ──────────────────────────────────────────────

/// Sensor com leitura fixa, ajustável pelo teste.
#[derive(Debug)]
pub struct FixedSensor {
    value: Mutex<f64>,
    failing: AtomicBool,
}

impl FixedSensor {
    pub fn new(value: f64) -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(value),
            failing: AtomicBool::new(false),
        })
    }

    /// Muda a leitura e volta a funcionar.
    pub fn set(&self, value: f64) {
        *lock(&self.value) = value;
        self.failing.store(false, Ordering::SeqCst);
    }

    /// Próximas leituras falham.
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

impl TemperatureSensor for FixedSensor {
    fn read_celsius(&self) -> io::Result<f64> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::other("sensor sem resposta"));
        }
        Ok(*lock(&self.value))
    }
}

/// Grava os pedidos de baixo consumo sem dormir.
#[derive(Debug)]
pub struct RecordingSleeper {
    max: Duration,
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new(max: Duration) -> Arc<Self> {
        Arc::new(Self {
            max,
            sleeps: Mutex::new(Vec::new()),
        })
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        lock(&self.sleeps).clone()
    }
}

impl SleepManager for RecordingSleeper {
    fn enter_low_power(&self, duration: Duration) {
        lock(&self.sleeps).push(duration);
    }

    fn max_low_power(&self) -> Duration {
        self.max
    }
}

// ──────────────────────────────────────────────
// Rede simulada
// ──────────────────────────────────────────────

pub struct SimNode {
    pub manager: Arc<TopologyManager>,
    pub radio: Arc<SimTransmitter>,
    pub sensor: Arc<FixedSensor>,
    pub sleeper: Arc<RecordingSleeper>,
}

pub struct SimNetwork {
    medium: Arc<SimMedium>,
    timings: Timings,
    nodes: BTreeMap<Address, SimNode>,
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new(slow_timings())
    }
}

impl SimNetwork {
    pub fn new(timings: Timings) -> Self {
        Self {
            medium: Arc::new(SimMedium::default()),
            timings,
            nodes: BTreeMap::new(),
        }
    }

    pub fn add_node(&mut self, address: &str, role: Role, celsius: f64) -> &SimNode {
        let radio = SimTransmitter::connected(address, Arc::clone(&self.medium));
        let sensor = FixedSensor::new(celsius);
        let sleeper = RecordingSleeper::new(Duration::from_secs(30));
        let manager = TopologyManager::new(
            address,
            role,
            self.timings,
            Collaborators {
                transmitter: radio.clone(),
                sensor: sensor.clone(),
                sleeper: sleeper.clone(),
            },
        );
        self.nodes.entry(address.to_string()).or_insert(SimNode {
            manager,
            radio,
            sensor,
            sleeper,
        })
    }

    pub fn node(&self, address: &str) -> &SimNode {
        self.nodes
            .get(address)
            .unwrap_or_else(|| panic!("nó {address} não existe"))
    }

    pub fn manager(&self, address: &str) -> &Arc<TopologyManager> {
        &self.node(address).manager
    }

    /// Coloca `a` e `b` ao alcance um do outro.
    pub fn link(&self, a: &str, b: &str) {
        lock(&self.medium.links).insert(SimMedium::key(a, b));
    }

    pub fn unlink(&self, a: &str, b: &str) {
        lock(&self.medium.links).remove(&SimMedium::key(a, b));
    }

    /// Entrega pacotes até a fila esvaziar. Devolve quantos foram entregues.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        while delivered < MAX_DELIVERIES {
            let Some(delivery) = self.medium.next() else {
                break;
            };
            delivered += 1;
            if let Some(node) = self.nodes.get(&delivery.to) {
                node.manager
                    .handle_datagram(delivery.mode, &delivery.from, &delivery.frame);
            }
        }
        delivered
    }

    /// Chama `start()` em todos os nós e entrega o tráfego.
    pub fn start(&self) -> usize {
        for node in self.nodes.values() {
            node.manager.start();
        }
        self.pump()
    }

    /// Um timeout de recepção em todos os nós, seguido de `pump`.
    pub fn tick_timeouts(&self) -> usize {
        for node in self.nodes.values() {
            node.manager.handle_timeout();
        }
        self.pump()
    }

    pub fn father_of(&self, address: &str) -> Option<Address> {
        self.nodes.get(address).and_then(|node| node.manager.father())
    }

    /// Todo nó comum tem pai.
    pub fn all_attached(&self) -> bool {
        self.nodes
            .values()
            .all(|node| node.manager.role() == Role::BaseStation || node.manager.is_attached())
    }

    /// Segue os pais a partir de qualquer nó e procura um ciclo.
    pub fn has_cycle(&self) -> bool {
        self.nodes.keys().any(|start| {
            let mut seen = BTreeSet::new();
            let mut current = Some(start.clone());
            while let Some(address) = current {
                if !seen.insert(address.clone()) {
                    return true;
                }
                current = self.father_of(&address);
            }
            false
        })
    }

    /// Caminho de `address` até a raiz, seguindo os pais.
    pub fn path_to_root(&self, address: &str) -> Vec<Address> {
        let mut path = vec![address.to_string()];
        while let Some(father) = path.last().and_then(|last| self.father_of(last)) {
            if path.contains(&father) {
                break;
            }
            path.push(father);
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// BS – A – B – C em linha.
    fn line() -> SimNetwork {
        let mut net = SimNetwork::default();
        net.add_node("BS", Role::BaseStation, 20.0);
        net.add_node("A", Role::Ordinary, 21.0);
        net.add_node("B", Role::Ordinary, 22.0);
        net.add_node("C", Role::Ordinary, 23.0);
        net.link("BS", "A");
        net.link("A", "B");
        net.link("B", "C");
        net
    }

    #[test]
    fn line_converges_with_hop_counts() {
        let net = line();
        assert!(net.start() > 0);

        assert!(net.all_attached());
        assert!(!net.has_cycle());
        assert_eq!(net.father_of("A").as_deref(), Some("BS"));
        assert_eq!(net.father_of("B").as_deref(), Some("A"));
        assert_eq!(net.father_of("C").as_deref(), Some("B"));
        assert_eq!(net.manager("A").hop_count(), 0);
        assert_eq!(net.manager("C").hop_count(), 2);
        assert_eq!(net.manager("BS").sons(), vec!["A".to_string()]);
        assert_eq!(net.manager("B").sons(), vec!["C".to_string()]);
    }

    #[test]
    fn grid_converges_without_cycles() {
        let mut net = SimNetwork::default();
        net.add_node("BS", Role::BaseStation, 20.0);
        let names: Vec<String> = (0..9).map(|i| format!("N{i}")).collect();
        for name in &names {
            net.add_node(name, Role::Ordinary, 20.0);
        }
        // Grade 3x3, BS ao lado de N0
        net.link("BS", "N0");
        for row in 0..3 {
            for col in 0..3 {
                let i = row * 3 + col;
                if col < 2 {
                    net.link(&names[i], &names[i + 1]);
                }
                if row < 2 {
                    net.link(&names[i], &names[i + 3]);
                }
            }
        }

        net.start();

        assert!(net.all_attached());
        assert!(!net.has_cycle());
        for name in &names {
            assert_eq!(net.path_to_root(name).last().map(String::as_str), Some("BS"));
        }
        // Cada filho aparece na lista do seu pai
        for name in &names {
            let father = net.father_of(name).unwrap();
            assert!(net.manager(&father).sons().contains(name));
        }
    }

    #[test]
    fn late_node_joins_through_timeout() {
        let mut net = line();
        net.start();

        net.add_node("D", Role::Ordinary, 24.0);
        net.link("C", "D");
        net.tick_timeouts();

        assert_eq!(net.father_of("D").as_deref(), Some("C"));
        assert_eq!(net.manager("D").hop_count(), 3);
        assert!(net.manager("C").sons().contains(&"D".to_string()));
    }

    #[test]
    fn broken_link_recovers_through_neighbor() {
        let net = line();
        net.start();
        assert_eq!(net.father_of("B").as_deref(), Some("A"));

        // A sai do alcance e B passa a ver a base
        net.unlink("A", "B");
        net.unlink("A", "BS");
        net.link("B", "BS");

        // O relatório de C fecha a janela de B; o envio para A falha
        let report = Temperature::new(now_millis(), 23.0, 1);
        assert!(net.manager("B").sensors().put_temperature("C", report));
        net.pump();

        assert_eq!(net.father_of("B").as_deref(), Some("BS"));
        assert_eq!(net.father_of("C").as_deref(), Some("B"));
        assert!(!net.manager("B").is_recovering());
        assert!(!net.has_cycle());
        assert_eq!(net.manager("C").hop_count(), 1);
    }

    #[test]
    fn readings_reach_the_base_station() {
        let mut net = SimNetwork::default();
        net.add_node("BS", Role::BaseStation, 0.0);
        net.add_node("A", Role::Ordinary, 20.0);
        net.add_node("B", Role::Ordinary, 26.0);
        net.link("BS", "A");
        net.link("A", "B");
        net.start();

        net.manager("B").sensors().schedule();
        net.pump();

        // A: (26·1 + 20) / 2 com peso 2
        let reading = net.manager("BS").sensors().network_reading().unwrap();
        assert_eq!(reading.subtree_weight, 2);
        assert!((reading.value_celsius - 23.0).abs() < 1e-9);
    }

    #[test]
    fn isolated_node_sleeps_after_timeouts() {
        let mut net = SimNetwork::default();
        net.add_node("A", Role::Ordinary, 20.0);
        for _ in 0..5 {
            net.tick_timeouts();
        }
        assert_eq!(net.node("A").sleeper.sleeps().len(), 1);
        assert_eq!(net.node("A").radio.sent_kind(PacketKind::Lost).len(), 5);
    }
}
