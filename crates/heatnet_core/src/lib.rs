//! # HeatNet Core
//!
//! Crate compartilhada que implementa a árvore de sensores do HeatNet:
//! protocolo de rádio, tabela de vizinhos, gerenciador de topologia e
//! agregação ponderada de temperaturas em direção à estação base.
//!
//! ## Módulos
//! - [`types`] – Estado do nó, temperaturas e registros de filhos
//! - [`protocol`] – Encode/decode binário dos pacotes (tag + bincode)
//! - [`config`] – Configuração unificada via TOML
//! - [`radio`] – Traits dos colaboradores externos (rádio, sensor, energia)
//! - [`neighbors`] – Cache do último estado visto de cada vizinho
//! - [`tree`] – Estado compartilhado da árvore (pai, filhos, janela)
//! - [`timer`] – Tarefas em background canceláveis
//! - [`aggregation`] – Sensor Manager: histerese, janela e média ponderada
//! - [`topology`] – Topology Manager: attach, filhos, recuperação, ping

pub mod aggregation;
pub mod config;
pub mod neighbors;
pub mod protocol;
pub mod radio;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod timer;
pub mod topology;
pub mod tree;
pub mod types;

use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-exports convenientes
pub use aggregation::SensorManager;
pub use config::{AppConfig, Timings};
pub use protocol::{Packet, PacketKind, decode_packet, encode_node_state, encode_temperature};
pub use radio::{SendMode, SleepManager, TemperatureSensor, TransmitError, Transmitter};
pub use topology::{Collaborators, TopologyManager};
pub use types::{Address, NodeState, Role, Temperature};

/// Trava um mutex ignorando envenenamento: o estado do nó continua válido
/// mesmo que uma thread de timer tenha entrado em pânico.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
