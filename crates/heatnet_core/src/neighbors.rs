//! Tabela de vizinhos.
//!
//! Guarda o último estado recebido de cada nó ao alcance do rádio. A
//! atualização é monotônica no timestamp do pacote: um broadcast duplicado ou
//! atrasado nunca sobrescreve um estado mais novo.
//!
//! A tabela trava só para inserir/buscar; cada registro tem seu próprio lock,
//! então atualizar um vizinho não bloqueia os outros.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::debug;

use crate::lock;
use crate::types::{Address, NodeState};

/// Último estado conhecido de um vizinho.
#[derive(Debug, Clone)]
pub struct NeighborRecord {
    pub address: Address,
    /// Estado como anunciado pelo vizinho
    pub state: NodeState,
    /// Timestamp carregado pelo pacote que produziu o estado
    pub timestamp: i64,
    /// Quando o último pacote (mesmo velho) foi recebido
    pub last_seen: Instant,
    /// Pacotes recebidos deste vizinho
    pub packets_received: u32,
}

/// Resultado de [`NeighborTable::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborUpdate {
    /// Primeiro pacote do vizinho
    Added,
    /// Estado substituído por um mais novo (ou igual)
    Updated,
    /// Pacote descreve estado mais velho que o registrado; ignorado
    Stale,
}

#[derive(Debug, Default)]
pub struct NeighborTable {
    entries: Mutex<HashMap<Address, Arc<Mutex<NeighborRecord>>>>,
}

impl NeighborTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra o estado recebido de `address`.
    pub fn observe(&self, address: &str, state: &NodeState) -> NeighborUpdate {
        let existing = {
            let mut entries = lock(&self.entries);
            match entries.get(address) {
                Some(record) => Arc::clone(record),
                None => {
                    entries.insert(
                        address.to_string(),
                        Arc::new(Mutex::new(NeighborRecord {
                            address: address.to_string(),
                            state: state.clone(),
                            timestamp: state.last_update,
                            last_seen: Instant::now(),
                            packets_received: 1,
                        })),
                    );
                    debug!("Vizinho adicionado: {address}");
                    return NeighborUpdate::Added;
                }
            }
        };

        let mut record = lock(&existing);
        record.last_seen = Instant::now();
        record.packets_received = record.packets_received.saturating_add(1);
        if state.last_update < record.timestamp {
            debug!(
                "Estado antigo de {address} ignorado ({} < {})",
                state.last_update, record.timestamp
            );
            return NeighborUpdate::Stale;
        }
        record.state = state.clone();
        record.timestamp = state.last_update;
        NeighborUpdate::Updated
    }

    /// Cópia do registro de um vizinho.
    pub fn get(&self, address: &str) -> Option<NeighborRecord> {
        let record = lock(&self.entries).get(address).map(Arc::clone)?;
        let snapshot = lock(&record).clone();
        Some(snapshot)
    }

    pub fn contains(&self, address: &str) -> bool {
        lock(&self.entries).contains_key(address)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
