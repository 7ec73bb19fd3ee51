//! Configuração unificada via TOML.
//!
//! Um único `config.toml` ao lado do executável. Toda seção usa
//! `#[serde(default)]`, então arquivos parciais funcionam.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::types::{DEFAULT_THRESHOLD, Role};

/// Identidade e rádio do nó.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Endereço de rádio ("ip:porta"). Vazio = `bind_ip:unicast_port`
    pub address: String,
    /// Papel: "ordinary" ou "basestation"
    pub role: Role,
    /// IP local para bind
    pub bind_ip: String,
    /// Porta dos pacotes unicast (e origem de todos os envios)
    pub unicast_port: u16,
    /// Porta onde todos os nós escutam broadcast
    pub broadcast_port: u16,
    /// Destino dos broadcasts
    pub broadcast_ip: String,
    /// Tempo sem pacotes até o laço de recepção considerar timeout (segundos)
    pub receive_timeout_secs: f64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            role: Role::Ordinary,
            bind_ip: "0.0.0.0".into(),
            unicast_port: 5600,
            broadcast_port: 5601,
            broadcast_ip: "255.255.255.255".into(),
            receive_timeout_secs: 10.0,
        }
    }
}

impl NodeConfig {
    /// Endereço efetivo do nó na rede.
    pub fn resolved_address(&self) -> String {
        if self.address.is_empty() {
            format!("{}:{}", self.bind_ip, self.unicast_port)
        } else {
            self.address.clone()
        }
    }
}

/// Parâmetros do Topology Manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Intervalo do PING para os filhos (segundos)
    pub ping_interval_secs: f64,
    /// Intervalo de rebroadcast de LOST durante a recuperação (segundos)
    pub relink_interval_secs: f64,
    /// Timeouts seguidos sem pai antes de dormir
    pub lost_limit: u32,
    /// Limiar usado pela estação base (herdado pelo resto da árvore)
    pub default_threshold: f64,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 60.0,
            relink_interval_secs: 5.0,
            lost_limit: 5,
            default_threshold: DEFAULT_THRESHOLD,
        }
    }
}

/// Parâmetros do Sensor Manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Período de leitura do sensor (segundos)
    pub sample_interval_secs: f64,
    /// Duração da janela de agregação (segundos)
    pub window_secs: f64,
    /// Atraso inicial da leitura por salto até a base (segundos)
    pub start_delay_per_hop_secs: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 5.0,
            window_secs: 10.0,
            start_delay_per_hop_secs: 2.0,
        }
    }
}

/// Gerenciamento de energia.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Duração máxima do modo de baixo consumo (segundos)
    pub max_low_power_secs: f64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            max_low_power_secs: 30.0,
        }
    }
}

/// Temporizações usadas pelos gerenciadores em tempo de execução.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timings {
    pub sample_interval: Duration,
    pub window: Duration,
    pub start_delay_per_hop: Duration,
    pub ping_interval: Duration,
    pub relink_interval: Duration,
    pub lost_limit: u32,
    pub default_threshold: f64,
}

impl Default for Timings {
    fn default() -> Self {
        AppConfig::default().timings()
    }
}

/// Configuração raiz do nó.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub topology: TopologyConfig,
    pub aggregation: AggregationConfig,
    pub power: PowerConfig,
}

impl AppConfig {
    /// Carrega configuração de um arquivo TOML.
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str::<AppConfig>(&content) {
                    Ok(config) => {
                        info!("Configuração carregada de {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        warn!("Erro ao parsear {}: {}", path.display(), e);
                    }
                },
                Err(e) => {
                    warn!("Erro ao ler {}: {}", path.display(), e);
                }
            }
        }

        info!("Usando configuração padrão");
        AppConfig::default()
    }

    /// Salva configuração em arquivo TOML.
    pub fn save(&self, path: &Path) -> Result<(), String> {
        let content = toml::to_string_pretty(self).map_err(|e| e.to_string())?;
        std::fs::write(path, content).map_err(|e| e.to_string())?;
        info!("Configuração salva em {}", path.display());
        Ok(())
    }

    /// Retorna o caminho padrão do config.toml.
    pub fn default_path() -> PathBuf {
        let exe_dir = std::env::current_exe()
            .map(|p| p.parent().unwrap_or(Path::new(".")).to_path_buf())
            .unwrap_or_else(|_| PathBuf::from("."));
        exe_dir.join("config.toml")
    }

    /// Temporizações para os gerenciadores.
    ///
    /// Durações inválidas (negativas, NaN) viram zero; [`validate`](Self::validate)
    /// reporta esses casos antes.
    pub fn timings(&self) -> Timings {
        Timings {
            sample_interval: secs(self.aggregation.sample_interval_secs),
            window: secs(self.aggregation.window_secs),
            start_delay_per_hop: secs(self.aggregation.start_delay_per_hop_secs),
            ping_interval: secs(self.topology.ping_interval_secs),
            relink_interval: secs(self.topology.relink_interval_secs),
            lost_limit: self.topology.lost_limit,
            default_threshold: self.topology.default_threshold,
        }
    }

    pub fn receive_timeout(&self) -> Duration {
        secs(self.node.receive_timeout_secs)
    }

    pub fn max_low_power(&self) -> Duration {
        secs(self.power.max_low_power_secs)
    }

    /// Valida a configuração e retorna lista de erros.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.node.unicast_port == 0 || self.node.broadcast_port == 0 {
            errors.push("Portas do nó não podem ser 0".into());
        }
        if self.node.unicast_port == self.node.broadcast_port {
            errors.push("Portas unicast e broadcast devem ser diferentes".into());
        }
        let address = self.node.resolved_address();
        if address.starts_with("0.0.0.0") {
            errors.push("Endereço do nó indefinido: configure `address` ou `bind_ip`".into());
        }
        // Precisa bater com a origem dos datagramas para filtrar o próprio broadcast
        match address.parse::<SocketAddr>() {
            Ok(parsed) if parsed.port() != self.node.unicast_port => errors.push(format!(
                "Porta de {address} difere de node.unicast_port ({})",
                self.node.unicast_port
            )),
            Ok(parsed) if parsed.to_string() != address => {
                errors.push(format!("Endereço {address} deve ser escrito como {parsed}"));
            }
            Ok(_) => {}
            Err(_) => errors.push(format!("Endereço {address} deve ser ip:porta")),
        }

        let periods = [
            ("node.receive_timeout_secs", self.node.receive_timeout_secs),
            ("topology.ping_interval_secs", self.topology.ping_interval_secs),
            ("topology.relink_interval_secs", self.topology.relink_interval_secs),
            ("aggregation.sample_interval_secs", self.aggregation.sample_interval_secs),
            ("aggregation.window_secs", self.aggregation.window_secs),
        ];
        for (name, value) in periods {
            if !(value > 0.0 && value <= 3600.0) {
                errors.push(format!("{name} inválido: {value} (0–3600)"));
            }
        }
        if self.aggregation.start_delay_per_hop_secs < 0.0 {
            errors.push("aggregation.start_delay_per_hop_secs não pode ser negativo".into());
        }
        if self.topology.lost_limit == 0 {
            errors.push("topology.lost_limit deve ser ≥ 1".into());
        }
        if !(self.topology.default_threshold > 0.0) {
            errors.push(format!(
                "Limiar inválido: {} (deve ser > 0)",
                self.topology.default_threshold
            ));
        }

        errors
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
