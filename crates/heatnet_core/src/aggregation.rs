//! Sensor Manager – amostragem com histerese e agregação ponderada.
//!
//! O watcher lê o sensor a cada `sample_interval` e dispara quando a leitura
//! se afasta da última reportada por pelo menos o limiar. No disparo:
//!
//! - **Sem filhos:** a leitura local vai direto ao pai com peso 1.
//! - **Com filhos:** abre uma janela de agregação (se nenhuma estiver aberta).
//!   Ao fechar, a média ponderada dos relatórios dos filhos e da leitura local
//!   sobe para o pai com o peso somado da subárvore.
//!
//! A janela fecha antes do prazo quando todos os filhos já reportaram. Falha
//! ao enviar para o pai aciona a recuperação do Topology Manager, que só age
//! se o destino que falhou ainda for o pai.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Timings;
use crate::lock;
use crate::radio::{TemperatureSensor, Transmitter};
use crate::timer::{PeriodicTask, TaskFlow};
use crate::tree::TreeState;
use crate::types::{Role, Temperature, now_millis};

/// Callback chamado com o endereço do pai que ficou inalcançável.
pub type RecoveryHook = Box<dyn Fn(&str) + Send + Sync>;

/// Média ponderada dos relatórios mais a leitura local (peso 1).
///
/// `avg = (Σ vᵢ·wᵢ + local) / (Σ wᵢ + 1)`. Devolve `(média, peso total)`, ou
/// `None` se o peso total é zero.
pub fn weighted_average(reports: &[Temperature], local: Option<f64>) -> Option<(f64, u32)> {
    let mut sum = 0.0;
    let mut weight: u32 = 0;
    for report in reports {
        sum += report.value_celsius * f64::from(report.subtree_weight);
        weight = weight.saturating_add(report.subtree_weight);
    }
    if let Some(value) = local {
        sum += value;
        weight = weight.saturating_add(1);
    }
    (weight > 0).then(|| (sum / f64::from(weight), weight))
}

/// Gatilho de histerese: dispara quando a leitura muda pelo menos `threshold`
/// desde a última leitura que disparou.
#[derive(Debug, Default, Clone)]
pub struct Hysteresis {
    last: Option<f64>,
}

impl Hysteresis {
    /// A primeira leitura só inicializa a referência.
    pub fn observe(&mut self, reading: f64, threshold: f64) -> bool {
        let Some(last) = self.last else {
            self.last = Some(reading);
            return false;
        };
        if (reading - last).abs() >= threshold {
            self.last = Some(reading);
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
struct Watcher {
    task: Option<PeriodicTask>,
    threshold: f64,
}

/// Motor de agregação de um nó.
pub struct SensorManager {
    tree: Arc<Mutex<TreeState>>,
    transmitter: Arc<dyn Transmitter>,
    sensor: Arc<dyn TemperatureSensor>,
    timings: Timings,
    recovery: RecoveryHook,
    watcher: Mutex<Watcher>,
    /// Timer da janela aberta, com a geração da janela
    window_timer: Mutex<Option<(u64, PeriodicTask)>>,
    last_local: Mutex<Option<f64>>,
    network_reading: Mutex<Option<Temperature>>,
    this: Weak<SensorManager>,
}

impl SensorManager {
    pub fn new(
        tree: Arc<Mutex<TreeState>>,
        transmitter: Arc<dyn Transmitter>,
        sensor: Arc<dyn TemperatureSensor>,
        timings: Timings,
        recovery: RecoveryHook,
    ) -> Arc<Self> {
        let threshold = lock(&tree).info().threshold;
        Arc::new_cyclic(|this| Self {
            tree,
            transmitter,
            sensor,
            timings,
            recovery,
            watcher: Mutex::new(Watcher {
                task: None,
                threshold,
            }),
            window_timer: Mutex::new(None),
            last_local: Mutex::new(None),
            network_reading: Mutex::new(None),
            this: this.clone(),
        })
    }

    // ──────────────────────────────────────────
    // Watcher de histerese
    // ──────────────────────────────────────────

    pub fn set_threshold(&self, threshold: f64) {
        lock(&self.watcher).threshold = threshold;
        debug!("Limiar atualizado para {threshold:.2}°C");
    }

    pub fn threshold(&self) -> f64 {
        lock(&self.watcher).threshold
    }

    /// Inicia o watcher com atraso proporcional aos saltos até a base.
    pub fn delayed_start(&self, hops: u32) {
        let delay = self.timings.start_delay_per_hop.saturating_mul(hops);
        info!("Monitoramento do sensor começa em {:.1}s", delay.as_secs_f64());
        self.start_after(delay);
    }

    /// Inicia o watcher agora. Não faz nada se já está rodando.
    pub fn start_temperature_monitor(&self) {
        self.start_after(Duration::ZERO);
    }

    fn start_after(&self, delay: Duration) {
        let mut watcher = lock(&self.watcher);
        if watcher.task.as_ref().is_some_and(PeriodicTask::is_active) {
            return;
        }

        let weak = self.this.clone();
        let mut hysteresis = Hysteresis::default();
        let spawned = PeriodicTask::spawn(
            "hysteresis-watcher",
            delay,
            self.timings.sample_interval,
            move || {
                let Some(engine) = weak.upgrade() else {
                    return TaskFlow::Stop;
                };
                if engine.poll_sensor(&mut hysteresis) {
                    engine.schedule();
                }
                TaskFlow::Continue
            },
        );

        match spawned {
            Ok(task) => {
                watcher.task = Some(task);
                info!(
                    "Monitoramento do sensor iniciado (limiar {:.2}°C)",
                    watcher.threshold
                );
            }
            Err(e) => error!("{e}"),
        }
    }

    /// Para o watcher. Não faz nada se já está parado.
    pub fn stop_temperature_monitor(&self) {
        if lock(&self.watcher).task.take().is_some() {
            info!("Monitoramento do sensor parado");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        lock(&self.watcher)
            .task
            .as_ref()
            .is_some_and(PeriodicTask::is_active)
    }

    fn poll_sensor(&self, hysteresis: &mut Hysteresis) -> bool {
        match self.sensor.read_celsius() {
            Ok(reading) => {
                *lock(&self.last_local) = Some(reading);
                let triggered = hysteresis.observe(reading, self.threshold());
                if triggered {
                    debug!("[SENSOR] Limiar excedido: {reading:.2}°C");
                }
                triggered
            }
            Err(e) => {
                debug!("[SENSOR] Leitura falhou: {e}");
                false
            }
        }
    }

    /// Leitura local, caindo para a última leitura boa se o sensor falhar.
    fn read_local(&self) -> Option<f64> {
        match self.sensor.read_celsius() {
            Ok(reading) => {
                *lock(&self.last_local) = Some(reading);
                Some(reading)
            }
            Err(e) => {
                let fallback = *lock(&self.last_local);
                debug!("[SENSOR] Leitura falhou ({e}), usando {fallback:?}");
                fallback
            }
        }
    }

    // ──────────────────────────────────────────
    // Agregação
    // ──────────────────────────────────────────

    /// Reage a um disparo do watcher.
    pub fn schedule(&self) {
        let generation = {
            let mut tree = lock(&self.tree);
            if !tree.has_sons() {
                None
            } else {
                match tree.open_window() {
                    Some(generation) => Some(generation),
                    None => return,
                }
            }
        };

        match generation {
            Some(generation) => self.arm_window(generation),
            None => self.send_temperature(),
        }
    }

    fn arm_window(&self, generation: u64) {
        let weak = self.this.clone();
        let spawned = PeriodicTask::once("aggregation-window", self.timings.window, move || {
            if let Some(engine) = weak.upgrade() {
                engine.close_window(Some(generation));
            }
        });

        match spawned {
            Ok(task) => {
                debug!("[AGGR] Janela {generation} aberta");
                let mut slot = lock(&self.window_timer);
                if slot.as_ref().is_none_or(|(g, _)| *g < generation) {
                    *slot = Some((generation, task));
                }
            }
            Err(e) => {
                error!("{e}; fechando janela {generation} imediatamente");
                self.close_window(Some(generation));
            }
        }
    }

    /// Registra o relatório de um filho. `false` se o remetente não é filho.
    ///
    /// Um relatório com a janela fechada abre uma nova, para que os dados dos
    /// filhos subam mesmo com a leitura local estável.
    pub fn put_temperature(&self, son: &str, temperature: Temperature) -> bool {
        let (opened, complete) = {
            let mut tree = lock(&self.tree);
            if !tree.record_report(son, temperature) {
                return false;
            }
            (tree.open_window(), tree.all_reported())
        };

        if !self.is_monitoring() {
            self.start_temperature_monitor();
        }
        if let (Some(generation), false) = (opened, complete) {
            self.arm_window(generation);
        }
        self.check_received_temperatures();
        true
    }

    /// Fecha a janela antes do prazo se todos os filhos já reportaram.
    pub fn check_received_temperatures(&self) -> bool {
        let complete = {
            let tree = lock(&self.tree);
            tree.is_window_open() && tree.all_reported()
        };
        complete && self.close_window(None)
    }

    /// Fecha a janela, calcula a média e envia ao pai.
    ///
    /// Com `generation`, só fecha se ainda for a mesma janela (o timer de uma
    /// janela já fechada cedo não faz nada).
    fn close_window(&self, generation: Option<u64>) -> bool {
        let (closed, reports, father, role) = {
            let mut tree = lock(&self.tree);
            if !tree.close_window(generation) {
                return false;
            }
            let reports = tree.reports();
            tree.reset_reports();
            (
                tree.window_generation(),
                reports,
                tree.father().map(str::to_string),
                tree.info().role,
            )
        };

        {
            let mut slot = lock(&self.window_timer);
            if slot.as_ref().is_some_and(|(g, _)| *g <= closed) {
                slot.take();
            }
        }

        if role == Role::BaseStation {
            self.record_network_reading(&reports);
            return true;
        }

        let local = self.read_local();
        if let Some((average, weight)) = weighted_average(&reports, local) {
            info!(
                "[AGGR] Janela {closed}: {} relatórios, média {average:.2}°C, peso {weight}",
                reports.len()
            );
            self.forward(father.as_deref(), average, weight);
        }
        true
    }

    /// Envia só a leitura local (nó folha).
    fn send_temperature(&self) {
        let (father, role) = {
            let tree = lock(&self.tree);
            (tree.father().map(str::to_string), tree.info().role)
        };
        if role == Role::BaseStation {
            return;
        }
        if let Some(value) = self.read_local() {
            self.forward(father.as_deref(), value, 1);
        }
    }

    fn forward(&self, father: Option<&str>, value: f64, weight: u32) {
        let Some(father) = father else {
            debug!("[AGGR] Sem pai, {value:.2}°C descartado");
            return;
        };

        match self.transmitter.send_temperature(father, value, weight) {
            Ok(()) => debug!("[DATA] {value:.2}°C (peso {weight}) → {father}"),
            Err(e) => {
                warn!("[ERROR] Não foi possível enviar dados ao pai {father}: {e}");
                self.recover(father);
            }
        }
    }

    fn record_network_reading(&self, reports: &[Temperature]) {
        let Some((average, weight)) = weighted_average(reports, None) else {
            return;
        };
        info!("[BASE] Temperatura da rede: {average:.2}°C ({weight} nós)");
        *lock(&self.network_reading) = Some(Temperature::new(now_millis(), average, weight));
    }

    /// Última média da rede inteira (só na estação base).
    pub fn network_reading(&self) -> Option<Temperature> {
        *lock(&self.network_reading)
    }

    /// Pede ao Topology Manager para religar o nó, se `failed` ainda for o pai.
    pub fn recover(&self, failed: &str) {
        info!("Tentando contato com um nó ao alcance do rádio");
        (self.recovery)(failed);
    }
}
