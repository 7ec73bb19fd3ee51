//! Definição de tipos/structs do nó sensor.
//!
//! O [`NodeState`] é o registro pequeno que cada nó mantém sobre si mesmo e
//! serializa em todo pacote de topologia. [`Temperature`] é o valor que sobe
//! pela árvore a cada agregação.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Endereço de rádio estável de um nó.
pub type Address = String;

/// Banda de histerese padrão (°C).
pub const DEFAULT_THRESHOLD: f64 = 0.2;

/// Milissegundos desde a época UNIX.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

// ──────────────────────────────────────────────
// Papel do nó
// ──────────────────────────────────────────────

/// Papel do nó na rede.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Nó sensor comum
    #[default]
    Ordinary,
    /// Raiz fixa da árvore
    BaseStation,
}

impl Role {
    /// Byte usado no payload de estado.
    pub fn as_byte(self) -> u8 {
        match self {
            Role::Ordinary => 0,
            Role::BaseStation => 1,
        }
    }

    /// Converte o byte do payload. `None` para valores desconhecidos.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Role::Ordinary),
            1 => Some(Role::BaseStation),
            _ => None,
        }
    }
}

// ──────────────────────────────────────────────
// Estado do nó
// ──────────────────────────────────────────────

/// Estado de um nó, próprio ou observado de um vizinho.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    /// Papel (comum ou estação base)
    pub role: Role,
    /// Endereço do pai na árvore (`None` = desconectado)
    pub father: Option<Address>,
    /// Quantidade de filhos
    pub son_count: u32,
    /// Distância até a estação base
    pub hop_count: u32,
    /// Banda de histerese (°C) herdada do pai
    pub threshold: f64,
    /// Timestamp da última alteração (ms)
    pub last_update: i64,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::new(Role::Ordinary)
    }
}

impl NodeState {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            father: None,
            son_count: 0,
            hop_count: 0,
            threshold: DEFAULT_THRESHOLD,
            last_update: now_millis(),
        }
    }

    pub fn is_base_station(&self) -> bool {
        self.role == Role::BaseStation
    }

    /// Marca o estado como alterado agora. Nunca volta no tempo, mesmo que o
    /// relógio do sistema volte.
    pub fn touch(&mut self) {
        self.last_update = now_millis().max(self.last_update);
    }
}

// ──────────────────────────────────────────────
// Temperatura
// ──────────────────────────────────────────────

/// Uma leitura (ou média ponderada de uma subárvore).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Temperature {
    /// Momento do envio (ms)
    pub timestamp: i64,
    /// Valor em °C
    pub value_celsius: f64,
    /// Nós cuja leitura está contida no valor (inclui quem reportou)
    pub subtree_weight: u32,
}

impl Temperature {
    pub fn new(timestamp: i64, value_celsius: f64, subtree_weight: u32) -> Self {
        Self {
            timestamp,
            value_celsius,
            subtree_weight,
        }
    }
}

// ──────────────────────────────────────────────
// Filhos
// ──────────────────────────────────────────────

/// Entrada de um filho no conjunto de filhos.
#[derive(Debug, Clone, PartialEq)]
pub struct SonRecord {
    pub address: Address,
    /// Último relatório TEMP (ausente até o primeiro)
    pub report: Option<Temperature>,
    /// Já contribuiu para a janela de agregação em andamento
    pub reported: bool,
}

impl SonRecord {
    pub fn new(address: impl Into<Address>) -> Self {
        Self {
            address: address.into(),
            report: None,
            reported: false,
        }
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
