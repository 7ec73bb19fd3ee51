//! Traits dos colaboradores externos: rádio, sensor de temperatura e
//! gerenciador de energia.
//!
//! Permitem rodar o mesmo núcleo sobre UDP, sobre um rádio simulado em
//! memória ou sobre hardware real.

use std::io;
use std::time::Duration;

use crate::protocol::{PacketKind, ProtocolError};
use crate::types::NodeState;

/// Modo de envio/recepção de um pacote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendMode {
    /// Melhor esforço para todos ao alcance
    Broadcast,
    /// Ponto a ponto. Falha de entrega detectada pelo transporte vira erro;
    /// transportes sem confirmação contam com o vigia do pai
    Unicast,
}

/// Erros de transmissão.
#[derive(Debug, thiserror::Error)]
pub enum TransmitError {
    #[error("Falha de E/S no rádio: {0}")]
    Io(#[from] io::Error),

    #[error("Falha ao montar pacote: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Envio unicast de {0} sem destino")]
    MissingDestination(PacketKind),
}

/// Transmissor usado pelos dois gerenciadores.
pub trait Transmitter: Send + Sync {
    /// Envia um pacote de topologia com o estado do nó.
    ///
    /// `destination` é obrigatório em [`SendMode::Unicast`] e ignorado em
    /// broadcast.
    fn send(
        &self,
        mode: SendMode,
        kind: PacketKind,
        state: &NodeState,
        destination: Option<&str>,
    ) -> Result<(), TransmitError>;

    /// Envia um TEMP unicast para `destination`.
    fn send_temperature(&self, destination: &str, value: f64, weight: u32) -> Result<(), TransmitError>;
}

/// Sensor físico de temperatura.
pub trait TemperatureSensor: Send + Sync {
    /// Leitura atual em °C. Falha de hardware vira `Err`.
    fn read_celsius(&self) -> io::Result<f64>;
}

/// Gerenciador de sono do dispositivo.
pub trait SleepManager: Send + Sync {
    /// Entra em baixo consumo por até `duration`. Bloqueia o chamador.
    fn enter_low_power(&self, duration: Duration);

    /// Maior duração permitida para o baixo consumo.
    fn max_low_power(&self) -> Duration;
}
