//! # HeatNet Node
//!
//! Nó sensor da árvore HeatNet sobre UDP. Lê a temperatura do host, forma a
//! árvore com os vizinhos e envia médias em direção à estação base.
//!
//! ## Uso
//! ```bash
//! heatnet_node    # lê config.toml ao lado do executável
//! ```
//!
//! Configure `node.address` com o "ip:porta" alcançável do nó e
//! `node.role = "basestation"` em exatamente um nó.

mod sensor;
mod udp;

use crossbeam_channel::RecvTimeoutError;
use heatnet_core::config::AppConfig;
use heatnet_core::{Collaborators, TopologyManager};
use sensor::{HostSensor, ThreadSleeper};
use std::sync::Arc;
use tracing::{error, info, warn};
use udp::UdpRadio;

fn main() {
    // ── Logging ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── Carregar config ──
    let config_path = AppConfig::default_path();
    let config = AppConfig::load(&config_path);

    // Salva config padrão se não existir
    if !config_path.exists() {
        if let Err(e) = config.save(&config_path) {
            warn!("Não foi possível salvar config padrão: {e}");
        }
    }

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            error!("Configuração inválida: {problem}");
        }
        eprintln!("Corrija {} e execute novamente.", config_path.display());
        std::process::exit(1);
    }

    let node_cfg = &config.node;
    let address = node_cfg.resolved_address();

    // ── Rádio UDP ──
    let radio = Arc::new(UdpRadio::bind(node_cfg).expect("Falha ao criar socket UDP"));
    let incoming = radio
        .spawn_listeners(node_cfg.broadcast_port)
        .expect("Falha ao criar threads de rede");

    // ── Topology Manager ──
    let manager = TopologyManager::new(
        address.clone(),
        node_cfg.role,
        config.timings(),
        Collaborators {
            transmitter: radio,
            sensor: Arc::new(HostSensor::new()),
            sleeper: Arc::new(ThreadSleeper::new(config.max_low_power())),
        },
    );

    // ── Banner ──
    println!();
    println!("══════════════════════════════════════════════");
    println!("   🌡 HEATNET NODE – ATIVO (Rust)");
    println!("══════════════════════════════════════════════");
    println!("  Endereço:  {address}");
    println!("  Papel:     {:?}", node_cfg.role);
    println!(
        "  Broadcast: {}:{}",
        node_cfg.broadcast_ip, node_cfg.broadcast_port
    );
    println!("  Timeout:   {:.1}s", node_cfg.receive_timeout_secs);
    println!("══════════════════════════════════════════════");
    println!();

    manager.start();

    // ── Loop principal ──
    let timeout = config.receive_timeout();
    loop {
        match incoming.recv_timeout(timeout) {
            Ok(msg) => manager.handle_packet(msg.mode, &msg.from, msg.packet),
            Err(RecvTimeoutError::Timeout) => manager.handle_timeout(),
            Err(RecvTimeoutError::Disconnected) => {
                error!("Threads de rede encerradas");
                break;
            }
        }
    }

    info!("Nó {address} encerrado");
}
