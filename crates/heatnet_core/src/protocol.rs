//! Protocolo de rádio binário.
//!
//! Todo pacote começa com a tag de tipo (1 byte), seguida do payload
//! serializado com bincode (big-endian, inteiros de largura fixa):
//!
//! ```text
//! ┌─────────┬──────────────────────────────────────────────────────────────┐
//! │ Tipo(1) │ Payload                                                      │
//! ├─────────┼──────────────────────────────────────────────────────────────┤
//! │ HELLO   │ ts(i64) papel(u8) pai(str) filhos(i32) saltos(i32) lim(f64)  │
//! │ REPLY   │ idem                                                         │
//! │ LOST    │ idem                                                         │
//! │ TIED    │ idem                                                         │
//! │ PING    │ idem                                                         │
//! │ TEMP    │ ts(i64) valor(f64) peso(i32)                                 │
//! └─────────┴──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Pai vazio (`""`) significa "sem pai". Bytes sobrando no fim do pacote são
//! rejeitados.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::types::{NodeState, Role, Temperature};

/// Tamanho mínimo de um pacote (só a tag).
const HEADER_SIZE: usize = 1;

/// Tamanho máximo de um datagrama aceito pelo rádio.
pub const MAX_PACKET_SIZE: usize = 1024;

/// Tipos de mensagem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Sonda de descoberta / convite para se ligar
    Hello = 1,
    /// Resposta a um HELLO em broadcast ("me liguei a você")
    Reply = 2,
    /// "Estou sem pai"
    Lost = 3,
    /// "Já tenho pai, me retire dos seus filhos"
    Tied = 4,
    /// Relatório de temperatura
    Temp = 5,
    /// Sonda de vida do pai para o filho
    Ping = 6,
}

impl PacketKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(PacketKind::Hello),
            2 => Some(PacketKind::Reply),
            3 => Some(PacketKind::Lost),
            4 => Some(PacketKind::Tied),
            5 => Some(PacketKind::Temp),
            6 => Some(PacketKind::Ping),
            _ => None,
        }
    }

    /// Se o tipo carrega o payload de estado do nó.
    pub fn carries_node_state(self) -> bool {
        self != PacketKind::Temp
    }

    pub fn name(self) -> &'static str {
        match self {
            PacketKind::Hello => "HELLO",
            PacketKind::Reply => "REPLY",
            PacketKind::Lost => "LOST",
            PacketKind::Tied => "TIED",
            PacketKind::Temp => "TEMP",
            PacketKind::Ping => "PING",
        }
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Erros do protocolo.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Pacote muito curto ({0} bytes, mínimo {HEADER_SIZE})")]
    TooShort(usize),

    #[error("Tipo de pacote desconhecido: 0x{0:02X}")]
    UnknownKind(u8),

    #[error("Tipo {0} não carrega este payload")]
    WrongPayload(PacketKind),

    #[error("Campo inválido: {0}")]
    InvalidField(String),

    #[error("Erro de serialização: {0}")]
    Serialize(String),

    #[error("Erro de deserialização: {0}")]
    Deserialize(String),
}

/// Pacote decodificado.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// HELLO, REPLY, LOST, TIED ou PING com o estado do remetente
    State { kind: PacketKind, state: NodeState },
    /// TEMP
    Temperature(Temperature),
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::State { kind, .. } => *kind,
            Packet::Temperature(_) => PacketKind::Temp,
        }
    }
}

// ──────────────────────────────────────────────
// Formato de fio
// ──────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct StateWire {
    timestamp: i64,
    role: u8,
    father: String,
    son_count: i32,
    hop_count: i32,
    threshold: f64,
}

#[derive(Serialize, Deserialize)]
struct TemperatureWire {
    timestamp: i64,
    value: f64,
    weight: i32,
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
}

fn to_wire_int(field: &str, value: u32) -> Result<i32, ProtocolError> {
    i32::try_from(value).map_err(|_| ProtocolError::InvalidField(format!("{field} = {value}")))
}

fn from_wire_int(field: &str, value: i32) -> Result<u32, ProtocolError> {
    u32::try_from(value).map_err(|_| ProtocolError::InvalidField(format!("{field} = {value}")))
}

fn frame<T: Serialize>(kind: PacketKind, body: &T) -> Result<Vec<u8>, ProtocolError> {
    let body = wire_options()
        .serialize(body)
        .map_err(|e| ProtocolError::Serialize(e.to_string()))?;

    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
    frame.push(kind as u8);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Codifica um pacote de topologia com o estado do nó.
///
/// O timestamp enviado é o `last_update` do estado.
pub fn encode_node_state(kind: PacketKind, state: &NodeState) -> Result<Vec<u8>, ProtocolError> {
    if !kind.carries_node_state() {
        return Err(ProtocolError::WrongPayload(kind));
    }

    let wire = StateWire {
        timestamp: state.last_update,
        role: state.role.as_byte(),
        father: state.father.clone().unwrap_or_default(),
        son_count: to_wire_int("son_count", state.son_count)?,
        hop_count: to_wire_int("hop_count", state.hop_count)?,
        threshold: state.threshold,
    };
    frame(kind, &wire)
}

/// Codifica um pacote TEMP.
pub fn encode_temperature(temperature: &Temperature) -> Result<Vec<u8>, ProtocolError> {
    let wire = TemperatureWire {
        timestamp: temperature.timestamp,
        value: temperature.value_celsius,
        weight: to_wire_int("weight", temperature.subtree_weight)?,
    };
    frame(PacketKind::Temp, &wire)
}

/// Decodifica bytes recebidos pelo rádio.
pub fn decode_packet(data: &[u8]) -> Result<Packet, ProtocolError> {
    if data.len() < HEADER_SIZE {
        return Err(ProtocolError::TooShort(data.len()));
    }

    let kind = PacketKind::from_byte(data[0]).ok_or(ProtocolError::UnknownKind(data[0]))?;
    let body = &data[HEADER_SIZE..];

    if kind == PacketKind::Temp {
        let wire: TemperatureWire = wire_options()
            .deserialize(body)
            .map_err(|e| ProtocolError::Deserialize(e.to_string()))?;
        return Ok(Packet::Temperature(Temperature {
            timestamp: wire.timestamp,
            value_celsius: wire.value,
            subtree_weight: from_wire_int("weight", wire.weight)?,
        }));
    }

    let wire: StateWire = wire_options()
        .deserialize(body)
        .map_err(|e| ProtocolError::Deserialize(e.to_string()))?;
    let role = Role::from_byte(wire.role)
        .ok_or_else(|| ProtocolError::InvalidField(format!("role = {}", wire.role)))?;

    Ok(Packet::State {
        kind,
        state: NodeState {
            role,
            father: (!wire.father.is_empty()).then_some(wire.father),
            son_count: from_wire_int("son_count", wire.son_count)?,
            hop_count: from_wire_int("hop_count", wire.hop_count)?,
            threshold: wire.threshold,
            last_update: wire.timestamp,
        },
    })
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
