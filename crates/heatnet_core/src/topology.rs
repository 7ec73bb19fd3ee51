//! Topology Manager – formação e manutenção da árvore.
//!
//! Recebe os pacotes do rádio, mantém a tabela de vizinhos, escolhe o pai,
//! admite e remove filhos, e recupera a ligação quando o pai some:
//!
//! - **HELLO** de um nó fora da árvore → adota como pai (ou responde TIED se
//!   já está ligado)
//! - **REPLY/LOST** → admite o remetente como filho; LOST do próprio pai
//!   derruba a subárvore em cascata
//! - **TIED** → remove o filho
//! - **PING** → prova de vida do pai; de outro nó responde TIED
//! - **TEMP** → relatório de um filho, repassado ao [`SensorManager`]
//!
//! Os handlers decidem sob o lock da árvore e só transmitem depois de soltá-lo.
//!
//! Qualquer pacote do pai conta como sinal de vida. O vigia do pai religa o
//! nó quando o pai fica mudo por mais de dois intervalos de PING, o que cobre
//! transportes que não acusam falha de entrega.

use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info, warn};

use crate::aggregation::SensorManager;
use crate::config::Timings;
use crate::lock;
use crate::neighbors::NeighborTable;
use crate::protocol::{Packet, PacketKind, decode_packet};
use crate::radio::{SendMode, SleepManager, TemperatureSensor, TransmitError, Transmitter};
use crate::timer::{PeriodicTask, TaskFlow};
use crate::tree::TreeState;
use crate::types::{Address, NodeState, Role, Temperature};

/// Dependências externas de um nó.
#[derive(Clone)]
pub struct Collaborators {
    pub transmitter: Arc<dyn Transmitter>,
    pub sensor: Arc<dyn TemperatureSensor>,
    pub sleeper: Arc<dyn SleepManager>,
}

#[derive(Debug, Default)]
struct LinkTasks {
    /// PING periódico para os filhos
    ping: Option<PeriodicTask>,
    /// Rebroadcast de LOST enquanto sem pai
    relink: Option<PeriodicTask>,
    /// Vigia do silêncio do pai
    watchdog: Option<PeriodicTask>,
}

enum HelloAction {
    Ignore,
    Refresh(f64),
    Attach {
        hops: u32,
        threshold: f64,
        first: bool,
        diffuse: bool,
    },
    Tied,
}

enum ReplyAction {
    Ignore,
    Cascade,
    Admit,
}

pub struct TopologyManager {
    address: Address,
    tree: Arc<Mutex<TreeState>>,
    neighbors: NeighborTable,
    transmitter: Arc<dyn Transmitter>,
    sleeper: Arc<dyn SleepManager>,
    sensors: Arc<SensorManager>,
    timings: Timings,
    tasks: Mutex<LinkTasks>,
    this: Weak<TopologyManager>,
}

impl TopologyManager {
    pub fn new(
        address: impl Into<Address>,
        role: Role,
        timings: Timings,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        let mut info = NodeState::new(role);
        info.threshold = timings.default_threshold;
        let tree = Arc::new(Mutex::new(TreeState::new(info)));

        Arc::new_cyclic(|this: &Weak<Self>| {
            let manager = this.clone();
            let sensors = SensorManager::new(
                Arc::clone(&tree),
                Arc::clone(&collaborators.transmitter),
                collaborators.sensor,
                timings,
                Box::new(move |failed: &str| {
                    if let Some(manager) = manager.upgrade() {
                        manager.link_from(failed);
                    }
                }),
            );

            Self {
                address: address.into(),
                tree,
                neighbors: NeighborTable::new(),
                transmitter: collaborators.transmitter,
                sleeper: collaborators.sleeper,
                sensors,
                timings,
                tasks: Mutex::new(LinkTasks::default()),
                this: this.clone(),
            }
        })
    }

    // ──────────────────────────────────────────
    // Acesso ao estado
    // ──────────────────────────────────────────

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn role(&self) -> Role {
        lock(&self.tree).info().role
    }

    /// Cópia do estado atual do nó.
    pub fn node_state(&self) -> NodeState {
        lock(&self.tree).info().clone()
    }

    pub fn father(&self) -> Option<Address> {
        lock(&self.tree).father().map(str::to_string)
    }

    pub fn hop_count(&self) -> u32 {
        lock(&self.tree).info().hop_count
    }

    pub fn sons(&self) -> Vec<Address> {
        lock(&self.tree).son_addresses()
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.tree).is_attached()
    }

    pub fn is_recovering(&self) -> bool {
        lock(&self.tree).recovering
    }

    pub fn sensors(&self) -> &Arc<SensorManager> {
        &self.sensors
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    pub fn is_ping_active(&self) -> bool {
        lock(&self.tasks).ping.as_ref().is_some_and(PeriodicTask::is_active)
    }

    pub fn is_relink_active(&self) -> bool {
        lock(&self.tasks)
            .relink
            .as_ref()
            .is_some_and(PeriodicTask::is_active)
    }

    pub fn is_watchdog_active(&self) -> bool {
        lock(&self.tasks)
            .watchdog
            .as_ref()
            .is_some_and(PeriodicTask::is_active)
    }

    // ──────────────────────────────────────────
    // Entrada de pacotes
    // ──────────────────────────────────────────

    /// Estação base difunde o HELLO inicial. Nós comuns esperam o primeiro timeout.
    pub fn start(&self) {
        {
            let mut tree = lock(&self.tree);
            if !tree.info().is_base_station() {
                return;
            }
            tree.hello_diffused = true;
        }
        info!("[TOPO] Estação base {} difundindo HELLO", self.address);
        self.broadcast(PacketKind::Hello);
    }

    /// Decodifica um datagrama bruto e despacha. Pacotes inválidos são descartados.
    pub fn handle_datagram(&self, mode: SendMode, from: &str, data: &[u8]) {
        match decode_packet(data) {
            Ok(packet) => self.handle_packet(mode, from, packet),
            Err(e) => debug!("Pacote inválido de {from}: {e}"),
        }
    }

    pub fn handle_packet(&self, mode: SendMode, from: &str, packet: Packet) {
        // Broadcast volta para o próprio remetente
        if from == self.address {
            return;
        }

        {
            let mut tree = lock(&self.tree);
            if tree.is_father(from) {
                tree.touch_father();
            }
        }

        match packet {
            Packet::State { kind, state } => {
                debug!("[RX] {kind} de {from} ({mode:?})");
                self.neighbors.observe(from, &state);
                match kind {
                    PacketKind::Hello => self.handle_hello(mode, from, &state),
                    PacketKind::Reply | PacketKind::Lost => self.handle_reply(mode, kind, from),
                    PacketKind::Tied => self.handle_tied(from),
                    PacketKind::Ping => self.handle_ping(from),
                    PacketKind::Temp => {}
                }
            }
            Packet::Temperature(temperature) => self.handle_temp(from, temperature),
        }
    }

    fn handle_hello(&self, mode: SendMode, from: &str, state: &NodeState) {
        // A tabela pode ter um estado mais novo que o do pacote
        let candidate = self
            .neighbors
            .get(from)
            .map(|record| record.state)
            .unwrap_or_else(|| state.clone());

        let action = {
            let mut tree = lock(&self.tree);
            if tree.is_father(from) {
                if tree.refresh_from_father(&candidate) {
                    HelloAction::Refresh(tree.info().threshold)
                } else {
                    HelloAction::Ignore
                }
            } else if tree.is_son(from) {
                HelloAction::Ignore
            } else if tree.is_rooted() {
                HelloAction::Tied
            } else if !advertises_root_path(&candidate, &self.address) {
                HelloAction::Ignore
            } else {
                tree.attach(from, &candidate);
                tree.recovering = false;
                let first = std::mem::replace(&mut tree.first_attach, false);
                let diffuse = !std::mem::replace(&mut tree.hello_diffused, true);
                HelloAction::Attach {
                    hops: tree.info().hop_count,
                    threshold: tree.info().threshold,
                    first,
                    diffuse,
                }
            }
        };

        match action {
            HelloAction::Ignore => {}
            HelloAction::Refresh(threshold) => {
                debug!("[TOPO] Estado do pai {from} atualizado");
                self.sensors.set_threshold(threshold);
            }
            HelloAction::Tied => self.reply(PacketKind::Tied, from),
            HelloAction::Attach {
                hops,
                threshold,
                first,
                diffuse,
            } => {
                info!("[TOPO] Pai adotado: {from} ({hops} saltos até a base)");
                if mode == SendMode::Broadcast {
                    self.reply(PacketKind::Reply, from);
                }
                if diffuse {
                    self.broadcast(PacketKind::Hello);
                }
                self.on_attached(first, hops, threshold);
            }
        }
    }

    fn on_attached(&self, first: bool, hops: u32, threshold: f64) {
        self.sensors.set_threshold(threshold);
        if first {
            self.sensors.delayed_start(hops);
        } else {
            self.sensors.start_temperature_monitor();
        }
        self.stop_relink_monitor();
        self.start_father_watchdog();
    }

    fn handle_reply(&self, mode: SendMode, kind: PacketKind, from: &str) {
        let action = {
            let mut tree = lock(&self.tree);
            if tree.is_father(from) {
                if kind == PacketKind::Lost {
                    ReplyAction::Cascade
                } else {
                    ReplyAction::Ignore
                }
            } else if !tree.is_rooted() || !tree.admit_son(from) {
                ReplyAction::Ignore
            } else {
                ReplyAction::Admit
            }
        };

        match action {
            ReplyAction::Ignore => {}
            ReplyAction::Cascade => {
                info!("[TOPO] Pai {from} perdeu a ligação");
                self.link_from(from);
            }
            ReplyAction::Admit => {
                info!("[TOPO] Filho admitido: {from}");
                self.sync_son_monitor();
                if mode == SendMode::Broadcast {
                    if let Err(e) = self.send(SendMode::Unicast, PacketKind::Hello, Some(from)) {
                        warn!("[ERROR] HELLO para {from} falhou: {e}");
                        self.drop_son(from);
                    }
                }
            }
        }
    }

    fn handle_tied(&self, from: &str) {
        self.drop_son(from);
    }

    fn handle_ping(&self, from: &str) {
        let from_father = lock(&self.tree).is_father(from);
        if !from_father {
            self.reply(PacketKind::Tied, from);
        }
    }

    fn handle_temp(&self, from: &str, temperature: Temperature) {
        if self.sensors.put_temperature(from, temperature) {
            debug!(
                "[DATA] {:.2}°C (peso {}) de {from}",
                temperature.value_celsius, temperature.subtree_weight
            );
        } else {
            debug!("TEMP de {from} ignorado: não é filho");
        }
    }

    /// Chamado pelo loop de recepção quando nenhum pacote chega no prazo.
    pub fn handle_timeout(&self) {
        let hibernate = {
            let mut tree = lock(&self.tree);
            if tree.is_rooted() {
                tree.lost_count = 0;
                return;
            }
            tree.lost_count += 1;
            if tree.lost_count >= self.timings.lost_limit {
                tree.lost_count = 0;
                true
            } else {
                false
            }
        };

        debug!("[TOPO] Timeout sem pai, difundindo LOST");
        self.broadcast(PacketKind::Lost);
        if hibernate {
            self.hibernate();
        }
    }

    /// Para as tarefas, dorme e religa o que estava rodando.
    fn hibernate(&self) {
        let had_ping = self.is_ping_active();
        let had_relink = self.is_relink_active();
        let was_monitoring = self.sensors.is_monitoring();

        self.stop_son_monitor();
        self.stop_relink_monitor();
        self.sensors.stop_temperature_monitor();

        let duration = self.sleeper.max_low_power();
        info!(
            "[POWER] {} timeouts sem pai, baixo consumo por {:.0}s",
            self.timings.lost_limit,
            duration.as_secs_f64()
        );
        self.sleeper.enter_low_power(duration);
        info!("[POWER] Acordado");

        if had_ping {
            self.sync_son_monitor();
        }
        if had_relink {
            self.start_relink_monitor();
        }
        if was_monitoring {
            self.sensors.start_temperature_monitor();
        }
    }

    // ──────────────────────────────────────────
    // Recuperação
    // ──────────────────────────────────────────

    /// Religa o nó depois de perder o pai. Chamadas repetidas durante a
    /// recuperação não fazem nada.
    pub fn link(&self) {
        self.relink(None);
    }

    /// Como [`link`](Self::link), mas só se `failed` ainda for o pai. Uma
    /// falha atrasada de envio ao pai antigo não derruba o pai novo.
    pub fn link_from(&self, failed: &str) {
        self.relink(Some(failed));
    }

    fn relink(&self, failed: Option<&str>) {
        let (old_father, released) = {
            let mut tree = lock(&self.tree);
            if tree.info().is_base_station() || tree.recovering {
                return;
            }
            if let Some(failed) = failed.filter(|f| !tree.is_father(f)) {
                debug!("[TOPO] Falha de {failed} ignorada: não é mais o pai");
                return;
            }
            tree.recovering = true;
            (tree.detach(), tree.release_sons())
        };

        warn!(
            "[TOPO] Ligação perdida (pai {}), soltando {} filhos",
            old_father.as_deref().unwrap_or("-"),
            released.len()
        );
        self.sensors.stop_temperature_monitor();
        self.sync_son_monitor();
        self.stop_father_watchdog();
        self.broadcast(PacketKind::Lost);
        self.start_relink_monitor();
    }

    /// Um passo do monitor de religação.
    pub fn relink_tick(&self) -> TaskFlow {
        let attached = {
            let mut tree = lock(&self.tree);
            if tree.is_attached() {
                tree.recovering = false;
            }
            tree.is_attached()
        };

        if attached {
            info!("[TOPO] Religado");
            TaskFlow::Stop
        } else {
            debug!("[TOPO] Ainda sem pai, difundindo LOST");
            self.broadcast(PacketKind::Lost);
            TaskFlow::Continue
        }
    }

    fn start_relink_monitor(&self) {
        let mut tasks = lock(&self.tasks);
        if tasks.relink.as_ref().is_some_and(PeriodicTask::is_active) {
            return;
        }
        let weak = self.this.clone();
        let interval = self.timings.relink_interval;
        match PeriodicTask::spawn("relink-monitor", interval, interval, move || {
            weak.upgrade().map_or(TaskFlow::Stop, |manager| manager.relink_tick())
        }) {
            Ok(task) => tasks.relink = Some(task),
            Err(e) => error!("{e}"),
        }
    }

    fn stop_relink_monitor(&self) {
        lock(&self.tasks).relink.take();
    }

    /// Um passo do vigia do pai.
    pub fn father_watchdog_tick(&self) -> TaskFlow {
        let limit = self.timings.ping_interval * 2;
        let (father, silence) = {
            let tree = lock(&self.tree);
            match (tree.father(), tree.father_silence()) {
                (Some(father), Some(silence)) => (father.to_string(), silence),
                _ => return TaskFlow::Stop,
            }
        };

        if silence <= limit {
            return TaskFlow::Continue;
        }
        warn!(
            "[TOPO] Pai {father} mudo há {:.1}s",
            silence.as_secs_f64()
        );
        self.link_from(&father);
        TaskFlow::Stop
    }

    fn start_father_watchdog(&self) {
        let mut tasks = lock(&self.tasks);
        if tasks.watchdog.as_ref().is_some_and(PeriodicTask::is_active) {
            return;
        }
        let weak = self.this.clone();
        let interval = self.timings.ping_interval;
        match PeriodicTask::spawn("father-watchdog", interval, interval, move || {
            weak.upgrade()
                .map_or(TaskFlow::Stop, |manager| manager.father_watchdog_tick())
        }) {
            Ok(task) => tasks.watchdog = Some(task),
            Err(e) => error!("{e}"),
        }
    }

    fn stop_father_watchdog(&self) {
        lock(&self.tasks).watchdog.take();
    }

    /// Esquece o pai sem iniciar recuperação.
    pub fn remove_father(&self) -> Option<Address> {
        let old = lock(&self.tree).detach();
        if let Some(father) = &old {
            info!("[TOPO] Pai {father} removido");
        }
        old
    }

    // ──────────────────────────────────────────
    // Filhos
    // ──────────────────────────────────────────

    fn drop_son(&self, son: &str) {
        if lock(&self.tree).remove_son(son) {
            info!("[TOPO] Filho removido: {son}");
            self.sync_son_monitor();
        }
    }

    /// Um passo do PING: filho que não recebe é removido.
    pub fn ping_sons(&self) {
        let sons = lock(&self.tree).son_addresses();
        for son in &sons {
            if let Err(e) = self.send(SendMode::Unicast, PacketKind::Ping, Some(son)) {
                warn!("[ERROR] Filho {son} não respondeu ao PING: {e}");
                self.drop_son(son);
            }
        }
    }

    /// Liga o PING se há filhos e desliga se não há. O conjunto de filhos é
    /// lido com o lock das tarefas preso, então duas chamadas concorrentes
    /// terminam sempre de acordo com o estado final.
    fn sync_son_monitor(&self) {
        let mut tasks = lock(&self.tasks);
        let has_sons = lock(&self.tree).has_sons();
        let active = tasks.ping.as_ref().is_some_and(PeriodicTask::is_active);

        if !has_sons {
            if tasks.ping.take().is_some() {
                debug!("[TOPO] PING dos filhos parado");
            }
            return;
        }
        if active {
            return;
        }
        let weak = self.this.clone();
        let interval = self.timings.ping_interval;
        match PeriodicTask::spawn("son-ping", interval, interval, move || match weak.upgrade() {
            Some(manager) => {
                manager.ping_sons();
                TaskFlow::Continue
            }
            None => TaskFlow::Stop,
        }) {
            Ok(task) => {
                tasks.ping = Some(task);
                debug!("[TOPO] PING dos filhos ativo");
            }
            Err(e) => error!("{e}"),
        }
    }

    fn stop_son_monitor(&self) {
        if lock(&self.tasks).ping.take().is_some() {
            debug!("[TOPO] PING dos filhos parado");
        }
    }

    // ──────────────────────────────────────────
    // Envio
    // ──────────────────────────────────────────

    fn send(&self, mode: SendMode, kind: PacketKind, destination: Option<&str>) -> Result<(), TransmitError> {
        let state = self.node_state();
        self.transmitter.send(mode, kind, &state, destination)
    }

    fn broadcast(&self, kind: PacketKind) {
        if let Err(e) = self.send(SendMode::Broadcast, kind, None) {
            warn!("[ERROR] Broadcast {kind} falhou: {e}");
        }
    }

    fn reply(&self, kind: PacketKind, to: &str) {
        if let Err(e) = self.send(SendMode::Unicast, kind, Some(to)) {
            warn!("[ERROR] {kind} para {to} falhou: {e}");
        }
    }
}

/// O candidato está na árvore e não é nosso filho.
fn advertises_root_path(candidate: &NodeState, own_address: &str) -> bool {
    candidate.is_base_station()
        || candidate
            .father
            .as_deref()
            .is_some_and(|father| father != own_address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_node_state;
    use crate::testing::{FixedSensor, RecordingSleeper, SimTransmitter, slow_timings};
    use std::io;
    use std::time::Duration;

    struct Node {
        manager: Arc<TopologyManager>,
        radio: Arc<SimTransmitter>,
        sleeper: Arc<RecordingSleeper>,
    }

    fn node(address: &str, role: Role) -> Node {
        node_with(address, role, slow_timings())
    }

    fn node_with(address: &str, role: Role, timings: Timings) -> Node {
        let radio = SimTransmitter::standalone(address);
        let sleeper = RecordingSleeper::new(Duration::from_secs(30));
        let manager = TopologyManager::new(
            address,
            role,
            timings,
            Collaborators {
                transmitter: radio.clone(),
                sensor: FixedSensor::new(20.0),
                sleeper: sleeper.clone(),
            },
        );
        Node {
            manager,
            radio,
            sleeper,
        }
    }

    fn base_state() -> NodeState {
        NodeState {
            threshold: 0.5,
            ..NodeState::new(Role::BaseStation)
        }
    }

    fn ordinary_state(father: Option<&str>, hops: u32) -> NodeState {
        NodeState {
            father: father.map(str::to_string),
            hop_count: hops,
            ..NodeState::new(Role::Ordinary)
        }
    }

    fn deliver(node: &Node, mode: SendMode, kind: PacketKind, from: &str, state: NodeState) {
        node.manager
            .handle_packet(mode, from, Packet::State { kind, state });
    }

    fn attached_to_base(address: &str) -> Node {
        let n = node(address, Role::Ordinary);
        deliver(&n, SendMode::Broadcast, PacketKind::Hello, "BS", base_state());
        n.radio.clear();
        n
    }

    #[test]
    fn hello_from_base_attaches_and_replies() {
        let n = node("A", Role::Ordinary);
        deliver(&n, SendMode::Broadcast, PacketKind::Hello, "BS", base_state());

        assert_eq!(n.manager.father().as_deref(), Some("BS"));
        assert_eq!(n.manager.hop_count(), 0);
        assert_eq!(n.manager.node_state().threshold, 0.5);
        assert_eq!(n.manager.sensors().threshold(), 0.5);
        assert!(n.manager.sensors().is_monitoring());

        let reply = n.radio.sent_kind(PacketKind::Reply);
        assert_eq!(reply.len(), 1);
        assert_eq!(reply[0].destination.as_deref(), Some("BS"));
        assert_eq!(n.radio.sent_kind(PacketKind::Hello).len(), 1);
    }

    #[test]
    fn unicast_hello_attaches_without_reply() {
        let n = node("A", Role::Ordinary);
        deliver(&n, SendMode::Unicast, PacketKind::Hello, "X", ordinary_state(Some("BS"), 2));

        assert_eq!(n.manager.father().as_deref(), Some("X"));
        assert_eq!(n.manager.hop_count(), 3);
        assert!(n.radio.sent_kind(PacketKind::Reply).is_empty());
    }

    #[test]
    fn hello_diffused_only_once() {
        let n = attached_to_base("A");
        n.manager.link();
        deliver(&n, SendMode::Broadcast, PacketKind::Hello, "X", ordinary_state(Some("BS"), 0));

        assert_eq!(n.manager.father().as_deref(), Some("X"));
        assert!(n.radio.sent_kind(PacketKind::Hello).is_empty());
    }

    #[test]
    fn attached_node_answers_hello_with_tied() {
        let n = attached_to_base("A");
        deliver(&n, SendMode::Broadcast, PacketKind::Hello, "X", ordinary_state(Some("BS"), 0));

        assert_eq!(n.manager.father().as_deref(), Some("BS"));
        let tied = n.radio.sent_kind(PacketKind::Tied);
        assert_eq!(tied.len(), 1);
        assert_eq!(tied[0].destination.as_deref(), Some("X"));
    }

    #[test]
    fn hello_from_unrooted_or_own_son_is_ignored() {
        let n = node("A", Role::Ordinary);
        deliver(&n, SendMode::Broadcast, PacketKind::Hello, "X", ordinary_state(None, 0));
        deliver(&n, SendMode::Broadcast, PacketKind::Hello, "Y", ordinary_state(Some("A"), 1));
        assert!(!n.manager.is_attached());
        assert!(n.radio.sent().is_empty());
    }

    #[test]
    fn hello_from_father_refreshes_state() {
        let n = attached_to_base("A");
        let newer = NodeState {
            threshold: 0.75,
            last_update: base_state().last_update + 10,
            ..base_state()
        };
        deliver(&n, SendMode::Broadcast, PacketKind::Hello, "BS", newer);

        assert_eq!(n.manager.node_state().threshold, 0.75);
        assert_eq!(n.manager.sensors().threshold(), 0.75);
        assert!(n.radio.sent().is_empty());
    }

    #[test]
    fn reply_admits_son_and_starts_ping() {
        let n = attached_to_base("A");
        deliver(&n, SendMode::Unicast, PacketKind::Reply, "B", ordinary_state(Some("A"), 1));

        assert_eq!(n.manager.sons(), vec!["B".to_string()]);
        assert_eq!(n.manager.node_state().son_count, 1);
        assert!(n.manager.is_ping_active());
        // REPLY unicast não pede HELLO de volta
        assert!(n.radio.sent().is_empty());
    }

    #[test]
    fn lost_broadcast_admits_son_and_sends_hello() {
        let n = attached_to_base("A");
        deliver(&n, SendMode::Broadcast, PacketKind::Lost, "B", ordinary_state(None, 0));

        assert_eq!(n.manager.sons(), vec!["B".to_string()]);
        let hello = n.radio.sent_kind(PacketKind::Hello);
        assert_eq!(hello.len(), 1);
        assert_eq!(hello[0].mode, SendMode::Unicast);
        assert_eq!(hello[0].destination.as_deref(), Some("B"));
    }

    #[test]
    fn unattached_node_does_not_admit() {
        let n = node("A", Role::Ordinary);
        deliver(&n, SendMode::Broadcast, PacketKind::Lost, "B", ordinary_state(None, 0));
        assert!(n.manager.sons().is_empty());
    }

    #[test]
    fn base_station_admits_sons() {
        let n = node("BS", Role::BaseStation);
        deliver(&n, SendMode::Unicast, PacketKind::Reply, "A", ordinary_state(Some("BS"), 0));
        assert_eq!(n.manager.sons(), vec!["A".to_string()]);
    }

    #[test]
    fn failed_hello_to_new_son_removes_it() {
        let n = attached_to_base("A");
        n.radio.fail_unicast_to("B");
        deliver(&n, SendMode::Broadcast, PacketKind::Lost, "B", ordinary_state(None, 0));
        assert!(n.manager.sons().is_empty());
        assert!(!n.manager.is_ping_active());
    }

    #[test]
    fn tied_removes_son_and_last_stops_ping() {
        let n = attached_to_base("A");
        deliver(&n, SendMode::Unicast, PacketKind::Reply, "B", ordinary_state(Some("A"), 1));
        deliver(&n, SendMode::Unicast, PacketKind::Reply, "C", ordinary_state(Some("A"), 1));

        deliver(&n, SendMode::Unicast, PacketKind::Tied, "B", ordinary_state(Some("X"), 1));
        assert_eq!(n.manager.sons(), vec!["C".to_string()]);
        assert!(n.manager.is_ping_active());

        deliver(&n, SendMode::Unicast, PacketKind::Tied, "C", ordinary_state(Some("X"), 1));
        assert!(n.manager.sons().is_empty());
        assert!(!n.manager.is_ping_active());
    }

    #[test]
    fn ping_failure_removes_only_that_son() {
        let n = attached_to_base("A");
        deliver(&n, SendMode::Unicast, PacketKind::Reply, "B", ordinary_state(Some("A"), 1));
        deliver(&n, SendMode::Unicast, PacketKind::Reply, "C", ordinary_state(Some("A"), 1));

        n.radio.fail_unicast_to("B");
        n.manager.ping_sons();
        assert_eq!(n.manager.sons(), vec!["C".to_string()]);
        assert_eq!(n.manager.father().as_deref(), Some("BS"));
        assert!(n.manager.is_ping_active());

        n.radio.fail_unicast_to("C");
        n.manager.ping_sons();
        assert!(n.manager.sons().is_empty());
        assert!(!n.manager.is_ping_active());
    }

    #[test]
    fn ping_survives_last_son_swapped_for_new_one() {
        let n = attached_to_base("A");
        deliver(&n, SendMode::Unicast, PacketKind::Reply, "C", ordinary_state(Some("A"), 1));

        // Saída de C e entrada de B intercaladas: B é admitido com o PING
        // ainda ativo e só depois a saída de C sincroniza a tarefa
        assert!(lock(&n.manager.tree).remove_son("C"));
        deliver(&n, SendMode::Unicast, PacketKind::Reply, "B", ordinary_state(Some("A"), 1));
        n.manager.sync_son_monitor();

        assert_eq!(n.manager.sons(), vec!["B".to_string()]);
        assert!(n.manager.is_ping_active());
    }

    #[test]
    fn concurrent_son_changes_leave_ping_consistent() {
        let n = attached_to_base("A");
        let workers: Vec<_> = (0..4)
            .map(|i| {
                let manager = Arc::clone(&n.manager);
                std::thread::spawn(move || {
                    let son = format!("S{i}");
                    let packet = |kind| Packet::State {
                        kind,
                        state: ordinary_state(Some("A"), 1),
                    };
                    for _ in 0..200 {
                        manager.handle_packet(SendMode::Unicast, &son, packet(PacketKind::Reply));
                        manager.handle_packet(SendMode::Unicast, &son, packet(PacketKind::Tied));
                    }
                    if i % 2 == 0 {
                        manager.handle_packet(SendMode::Unicast, &son, packet(PacketKind::Reply));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(n.manager.sons(), vec!["S0".to_string(), "S2".to_string()]);
        assert!(n.manager.is_ping_active());

        deliver(&n, SendMode::Unicast, PacketKind::Tied, "S0", ordinary_state(Some("X"), 1));
        deliver(&n, SendMode::Unicast, PacketKind::Tied, "S2", ordinary_state(Some("X"), 1));
        assert!(!n.manager.is_ping_active());
    }

    #[test]
    fn ping_from_stranger_gets_tied() {
        let n = attached_to_base("A");
        deliver(&n, SendMode::Unicast, PacketKind::Ping, "BS", base_state());
        assert!(n.radio.sent().is_empty());

        deliver(&n, SendMode::Unicast, PacketKind::Ping, "X", ordinary_state(Some("BS"), 0));
        let tied = n.radio.sent_kind(PacketKind::Tied);
        assert_eq!(tied.len(), 1);
        assert_eq!(tied[0].destination.as_deref(), Some("X"));
    }

    #[test]
    fn link_is_idempotent() {
        let n = attached_to_base("A");
        deliver(&n, SendMode::Unicast, PacketKind::Reply, "B", ordinary_state(Some("A"), 1));

        n.manager.link();
        n.manager.link();

        assert!(!n.manager.is_attached());
        assert!(n.manager.is_recovering());
        assert!(n.manager.sons().is_empty());
        assert!(!n.manager.is_ping_active());
        assert!(!n.manager.sensors().is_monitoring());
        assert!(n.manager.is_relink_active());
        assert_eq!(n.radio.sent_kind(PacketKind::Lost).len(), 1);

        assert_eq!(n.manager.relink_tick(), TaskFlow::Continue);
        assert_eq!(n.radio.sent_kind(PacketKind::Lost).len(), 2);
    }

    #[test]
    fn reattach_ends_recovery() {
        let n = attached_to_base("A");
        n.manager.link();
        deliver(&n, SendMode::Unicast, PacketKind::Hello, "X", ordinary_state(Some("BS"), 0));

        assert!(!n.manager.is_recovering());
        assert!(!n.manager.is_relink_active());
        assert!(n.manager.sensors().is_monitoring());
        assert_eq!(n.manager.relink_tick(), TaskFlow::Stop);
    }

    /// Entrega LOST do pai e HELLO de um novo pai enquanto o TEMP está em
    /// voo, e então falha o TEMP.
    struct RacingRadio {
        inner: Arc<SimTransmitter>,
        manager: Mutex<Weak<TopologyManager>>,
    }

    impl Transmitter for RacingRadio {
        fn send(
            &self,
            mode: SendMode,
            kind: PacketKind,
            state: &NodeState,
            destination: Option<&str>,
        ) -> Result<(), TransmitError> {
            self.inner.send(mode, kind, state, destination)
        }

        fn send_temperature(&self, destination: &str, _value: f64, _weight: u32) -> Result<(), TransmitError> {
            let manager = lock(&self.manager).upgrade();
            if let Some(manager) = manager {
                manager.handle_packet(
                    SendMode::Broadcast,
                    "BS",
                    Packet::State {
                        kind: PacketKind::Lost,
                        state: base_state(),
                    },
                );
                manager.handle_packet(
                    SendMode::Unicast,
                    "F2",
                    Packet::State {
                        kind: PacketKind::Hello,
                        state: ordinary_state(Some("BS"), 0),
                    },
                );
            }
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, format!("{destination} inalcançável")).into())
        }
    }

    #[test]
    fn late_send_failure_keeps_new_father() {
        let inner = SimTransmitter::standalone("A");
        let radio = Arc::new(RacingRadio {
            inner: Arc::clone(&inner),
            manager: Mutex::new(Weak::new()),
        });
        let manager = TopologyManager::new(
            "A",
            Role::Ordinary,
            slow_timings(),
            Collaborators {
                transmitter: radio.clone(),
                sensor: FixedSensor::new(20.0),
                sleeper: RecordingSleeper::new(Duration::from_secs(30)),
            },
        );
        manager.handle_packet(
            SendMode::Broadcast,
            "BS",
            Packet::State {
                kind: PacketKind::Hello,
                state: base_state(),
            },
        );
        *lock(&radio.manager) = Arc::downgrade(&manager);

        manager.sensors().schedule();

        assert_eq!(manager.father().as_deref(), Some("F2"));
        assert!(!manager.is_recovering());
        assert!(manager.sensors().is_monitoring());
        assert_eq!(inner.sent_kind(PacketKind::Lost).len(), 1);
    }

    #[test]
    fn failure_of_former_father_is_ignored() {
        let n = attached_to_base("A");
        deliver(&n, SendMode::Broadcast, PacketKind::Lost, "BS", base_state());
        deliver(&n, SendMode::Unicast, PacketKind::Hello, "F2", ordinary_state(Some("BS"), 0));
        n.radio.clear();

        n.manager.link_from("BS");
        assert_eq!(n.manager.father().as_deref(), Some("F2"));
        assert!(!n.manager.is_recovering());
        assert!(n.radio.sent().is_empty());

        n.manager.link_from("F2");
        assert!(!n.manager.is_attached());
        assert!(n.manager.is_recovering());
    }

    fn fast_ping() -> Timings {
        Timings {
            ping_interval: Duration::from_millis(100),
            ..slow_timings()
        }
    }

    #[test]
    fn silent_father_triggers_relink() {
        let n = node_with("A", Role::Ordinary, fast_ping());
        deliver(&n, SendMode::Broadcast, PacketKind::Hello, "BS", base_state());
        assert!(n.manager.is_watchdog_active());
        n.radio.clear();

        std::thread::sleep(Duration::from_secs(1));

        assert!(!n.manager.is_attached());
        assert!(n.manager.is_recovering());
        assert!(!n.manager.is_watchdog_active());
        assert_eq!(n.radio.sent_kind(PacketKind::Lost).len(), 1);
        assert_eq!(n.manager.father_watchdog_tick(), TaskFlow::Stop);
    }

    #[test]
    fn pinged_node_keeps_father() {
        let n = node_with("A", Role::Ordinary, fast_ping());
        deliver(&n, SendMode::Broadcast, PacketKind::Hello, "BS", base_state());

        for _ in 0..15 {
            std::thread::sleep(Duration::from_millis(40));
            deliver(&n, SendMode::Unicast, PacketKind::Ping, "BS", base_state());
        }

        assert_eq!(n.manager.father().as_deref(), Some("BS"));
        assert!(!n.manager.is_recovering());
        assert!(n.manager.is_watchdog_active());
    }

    #[test]
    fn lost_from_father_cascades() {
        let n = attached_to_base("A");
        deliver(&n, SendMode::Broadcast, PacketKind::Lost, "BS", base_state());

        assert!(!n.manager.is_attached());
        assert!(n.manager.is_recovering());
        assert_eq!(n.radio.sent_kind(PacketKind::Lost).len(), 1);
    }

    #[test]
    fn base_station_never_relinks() {
        let n = node("BS", Role::BaseStation);
        n.manager.link();
        assert!(!n.manager.is_recovering());
        assert!(n.radio.sent().is_empty());
    }

    #[test]
    fn base_station_start_broadcasts_hello() {
        let bs = node("BS", Role::BaseStation);
        bs.manager.start();
        assert_eq!(bs.radio.sent_kind(PacketKind::Hello).len(), 1);

        let a = node("A", Role::Ordinary);
        a.manager.start();
        assert!(a.radio.sent().is_empty());
    }

    #[test]
    fn timeouts_lead_to_low_power() {
        let n = node("A", Role::Ordinary);
        for _ in 0..4 {
            n.manager.handle_timeout();
        }
        assert!(n.sleeper.sleeps().is_empty());
        n.manager.handle_timeout();

        assert_eq!(n.sleeper.sleeps(), vec![Duration::from_secs(30)]);
        assert_eq!(n.radio.sent_kind(PacketKind::Lost).len(), 5);

        // Contador reiniciado
        n.manager.handle_timeout();
        assert_eq!(n.sleeper.sleeps().len(), 1);
    }

    #[test]
    fn attached_node_ignores_timeouts() {
        let n = attached_to_base("A");
        for _ in 0..10 {
            n.manager.handle_timeout();
        }
        assert!(n.radio.sent().is_empty());
        assert!(n.sleeper.sleeps().is_empty());
    }

    #[test]
    fn hibernate_rearms_tasks() {
        let n = attached_to_base("A");
        deliver(&n, SendMode::Unicast, PacketKind::Reply, "B", ordinary_state(Some("A"), 1));
        n.manager.hibernate();

        assert_eq!(n.sleeper.sleeps().len(), 1);
        assert!(n.manager.is_ping_active());
        assert!(n.manager.sensors().is_monitoring());
    }

    #[test]
    fn own_and_malformed_packets_are_dropped() {
        let n = node("A", Role::Ordinary);
        let frame = encode_node_state(PacketKind::Hello, &base_state()).unwrap();
        n.manager.handle_datagram(SendMode::Broadcast, "A", &frame);
        n.manager.handle_datagram(SendMode::Broadcast, "BS", &[0xFF, 1, 2]);
        assert!(!n.manager.is_attached());
        assert!(n.manager.neighbors().is_empty());

        n.manager.handle_datagram(SendMode::Broadcast, "BS", &frame);
        assert!(n.manager.is_attached());
        assert!(n.manager.neighbors().contains("BS"));
    }

    #[test]
    fn temperature_from_stranger_is_ignored() {
        let n = attached_to_base("A");
        n.manager.handle_packet(
            SendMode::Unicast,
            "Z",
            Packet::Temperature(Temperature::new(1, 30.0, 1)),
        );
        assert!(n.radio.sent().is_empty());
    }

    #[test]
    fn remove_father_does_not_recover() {
        let n = attached_to_base("A");
        assert_eq!(n.manager.remove_father().as_deref(), Some("BS"));
        assert!(!n.manager.is_recovering());
        assert!(n.radio.sent().is_empty());
    }
}
