//! Rádio UDP: transmissor do nó e threads de escuta.
//!
//! Todos os envios saem do socket unicast (`bind_ip:unicast_port`), então o
//! endereço de origem visto pelos vizinhos é o endereço do nó. Broadcast vai
//! para `broadcast_ip:broadcast_port`, onde cada nó tem uma segunda thread
//! escutando.
//!
//! UDP não confirma entrega: só falhas locais de envio viram erro. Um pai
//! morto é detectado pelo vigia do Topology Manager, que religa o nó quando
//! nenhum pacote do pai chega em dois intervalos de PING.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use heatnet_core::config::NodeConfig;
use heatnet_core::protocol::{MAX_PACKET_SIZE, Packet, decode_packet, encode_node_state, encode_temperature};
use heatnet_core::types::now_millis;
use heatnet_core::{NodeState, PacketKind, SendMode, Temperature, TransmitError, Transmitter};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pacote decodificado entregue ao laço principal.
#[derive(Debug, Clone)]
pub struct Incoming {
    pub mode: SendMode,
    pub from: String,
    pub packet: Packet,
}

pub struct UdpRadio {
    socket: UdpSocket,
    broadcast_target: String,
}

impl UdpRadio {
    pub fn bind(config: &NodeConfig) -> io::Result<Self> {
        let socket = UdpSocket::bind((config.bind_ip.as_str(), config.unicast_port))?;
        socket.set_broadcast(true)?;
        Ok(Self {
            socket,
            broadcast_target: format!("{}:{}", config.broadcast_ip, config.broadcast_port),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Inicia as threads de escuta (unicast e broadcast). Retorna o receiver do channel.
    pub fn spawn_listeners(&self, broadcast_port: u16) -> io::Result<Receiver<Incoming>> {
        let (tx, rx) = bounded::<Incoming>(64); // Buffer de 64 pacotes

        let unicast = self.socket.try_clone()?;
        let unicast_tx = tx.clone();
        std::thread::Builder::new()
            .name("udp-unicast".into())
            .spawn(move || listen(&unicast, SendMode::Unicast, &unicast_tx))?;

        std::thread::Builder::new()
            .name("udp-broadcast".into())
            .spawn(move || broadcast_loop(broadcast_port, &tx))?;

        Ok(rx)
    }

    fn transmit(&self, frame: &[u8], target: &str) -> Result<(), TransmitError> {
        let sent = self.socket.send_to(frame, target)?;
        if sent != frame.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "datagrama truncado").into());
        }
        debug!("→ {sent} bytes para {target}");
        Ok(())
    }
}

impl Transmitter for UdpRadio {
    fn send(
        &self,
        mode: SendMode,
        kind: PacketKind,
        state: &NodeState,
        destination: Option<&str>,
    ) -> Result<(), TransmitError> {
        let frame = encode_node_state(kind, state)?;
        match mode {
            SendMode::Broadcast => self.transmit(&frame, &self.broadcast_target),
            SendMode::Unicast => {
                let target = destination.ok_or(TransmitError::MissingDestination(kind))?;
                self.transmit(&frame, target)
            }
        }
    }

    fn send_temperature(&self, destination: &str, value: f64, weight: u32) -> Result<(), TransmitError> {
        let frame = encode_temperature(&Temperature::new(now_millis(), value, weight))?;
        self.transmit(&frame, destination)
    }
}

fn broadcast_loop(port: u16, tx: &Sender<Incoming>) {
    loop {
        match UdpSocket::bind(format!("0.0.0.0:{port}")) {
            Ok(sock) => {
                info!("Escutando broadcast em 0.0.0.0:{port}");
                listen(&sock, SendMode::Broadcast, tx);
                return;
            }
            Err(e) => {
                error!("Falha ao bind porta {port}: {e}. Tentando novamente em 2s...");
                std::thread::sleep(Duration::from_secs(2));
            }
        }
    }
}

/// Lê datagramas até o laço principal fechar o channel.
fn listen(sock: &UdpSocket, mode: SendMode, tx: &Sender<Incoming>) {
    sock.set_read_timeout(Some(Duration::from_secs(1))).ok();

    let mut buf = [0u8; MAX_PACKET_SIZE];
    loop {
        match sock.recv_from(&mut buf) {
            Ok((size, addr)) => {
                let from = addr.to_string();
                match decode_packet(&buf[..size]) {
                    Ok(packet) => {
                        let msg = Incoming { mode, from, packet };
                        match tx.try_send(msg) {
                            Ok(()) => {}
                            // Laço principal ocupado (ou dormindo): descarta
                            Err(TrySendError::Full(_)) => debug!("Channel cheio, descartando pacote"),
                            Err(TrySendError::Disconnected(_)) => return,
                        }
                    }
                    Err(e) => debug!("Pacote inválido de {from}: {e}"),
                }
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock =>
            {
                // Timeout normal, continua
            }
            Err(e) => warn!("Erro ao receber UDP: {e}"),
        }
    }
}
