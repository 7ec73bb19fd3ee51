//! Estado da árvore compartilhado pelos dois gerenciadores.
//!
//! Pai, filhos, relatórios dos filhos e a janela de agregação vivem juntos
//! atrás de um único mutex por nó: a admissão de um filho e a chegada de um
//! relatório concorrente nunca se intercalam.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::types::{Address, NodeState, Role, SonRecord, Temperature};

/// Estado mutável da árvore de um nó.
#[derive(Debug)]
pub struct TreeState {
    info: NodeState,
    sons: BTreeMap<Address, SonRecord>,
    window_open: bool,
    window_generation: u64,
    /// Último pacote recebido do pai
    father_seen: Option<Instant>,
    /// HELLO de descoberta já foi difundido
    pub(crate) hello_diffused: bool,
    /// Próximo attach é o primeiro (leitura começa com atraso por salto)
    pub(crate) first_attach: bool,
    /// Recuperação de pai em andamento
    pub(crate) recovering: bool,
    /// Timeouts seguidos sem pai
    pub(crate) lost_count: u32,
}

impl TreeState {
    pub fn new(info: NodeState) -> Self {
        Self {
            info,
            sons: BTreeMap::new(),
            window_open: false,
            window_generation: 0,
            father_seen: None,
            hello_diffused: false,
            first_attach: true,
            recovering: false,
            lost_count: 0,
        }
    }

    pub fn info(&self) -> &NodeState {
        &self.info
    }

    pub fn father(&self) -> Option<&str> {
        self.info.father.as_deref()
    }

    pub fn is_father(&self, address: &str) -> bool {
        self.father() == Some(address)
    }

    /// Tem pai.
    pub fn is_attached(&self) -> bool {
        self.info.father.is_some()
    }

    /// Faz parte da árvore: tem pai ou é a própria raiz.
    pub fn is_rooted(&self) -> bool {
        self.info.is_base_station() || self.is_attached()
    }

    // ──────────────────────────────────────────
    // Pai
    // ──────────────────────────────────────────

    /// Adota `father` como pai a partir do estado anunciado por ele.
    pub fn attach(&mut self, father: &str, father_state: &NodeState) {
        self.info.father = Some(father.to_string());
        self.info.threshold = father_state.threshold;
        self.info.hop_count = hops_below(father_state);
        self.lost_count = 0;
        self.father_seen = Some(Instant::now());
        self.info.touch();
    }

    /// Registra um pacote vindo do pai.
    pub fn touch_father(&mut self) {
        if self.is_attached() {
            self.father_seen = Some(Instant::now());
        }
    }

    /// Tempo desde o último pacote do pai. `None` sem pai.
    pub fn father_silence(&self) -> Option<Duration> {
        self.father_seen.map(|seen| seen.elapsed())
    }

    /// Atualiza saltos e limiar com um estado mais novo do pai atual.
    /// Devolve `true` se algo mudou.
    pub fn refresh_from_father(&mut self, father_state: &NodeState) -> bool {
        let hops = hops_below(father_state);
        if hops == self.info.hop_count && father_state.threshold == self.info.threshold {
            return false;
        }
        self.info.hop_count = hops;
        self.info.threshold = father_state.threshold;
        self.info.touch();
        true
    }

    /// Esquece o pai. Devolve o pai antigo.
    pub fn detach(&mut self) -> Option<Address> {
        let old = self.info.father.take();
        self.father_seen = None;
        if old.is_some() {
            self.info.touch();
        }
        old
    }

    // ──────────────────────────────────────────
    // Filhos
    // ──────────────────────────────────────────

    pub fn is_son(&self, address: &str) -> bool {
        self.sons.contains_key(address)
    }

    pub fn has_sons(&self) -> bool {
        !self.sons.is_empty()
    }

    pub fn son_addresses(&self) -> Vec<Address> {
        self.sons.keys().cloned().collect()
    }

    pub fn son(&self, address: &str) -> Option<&SonRecord> {
        self.sons.get(address)
    }

    /// Admite um filho sem relatório. `false` se já era filho.
    pub fn admit_son(&mut self, address: &str) -> bool {
        if self.sons.contains_key(address) {
            return false;
        }
        self.sons.insert(address.to_string(), SonRecord::new(address));
        self.sync_son_count();
        true
    }

    /// Remove um filho e descarta seu relatório. `false` se não era filho.
    pub fn remove_son(&mut self, address: &str) -> bool {
        if self.sons.remove(address).is_none() {
            return false;
        }
        self.sync_son_count();
        true
    }

    /// Solta todos os filhos de uma vez.
    pub fn release_sons(&mut self) -> Vec<Address> {
        let released: Vec<Address> = std::mem::take(&mut self.sons).into_keys().collect();
        self.sync_son_count();
        released
    }

    fn sync_son_count(&mut self) {
        self.info.son_count = self.sons.len() as u32;
        self.info.touch();
    }

    // ──────────────────────────────────────────
    // Relatórios e janela de agregação
    // ──────────────────────────────────────────

    /// Guarda o relatório de um filho e o marca como reportado.
    /// `false` se o remetente não é filho.
    pub fn record_report(&mut self, address: &str, temperature: Temperature) -> bool {
        match self.sons.get_mut(address) {
            Some(son) => {
                son.report = Some(temperature);
                son.reported = true;
                true
            }
            None => false,
        }
    }

    /// Todo filho atual já reportou nesta janela.
    pub fn all_reported(&self) -> bool {
        self.has_sons() && self.sons.values().all(|s| s.reported)
    }

    /// Limpa o `reported` de todos os filhos.
    pub fn reset_reports(&mut self) {
        for son in self.sons.values_mut() {
            son.reported = false;
        }
    }

    /// Último relatório de cada filho que já reportou alguma vez.
    pub fn reports(&self) -> Vec<Temperature> {
        self.sons.values().filter_map(|s| s.report).collect()
    }

    pub fn is_window_open(&self) -> bool {
        self.window_open
    }

    pub fn window_generation(&self) -> u64 {
        self.window_generation
    }

    /// Abre uma janela se nenhuma está aberta. Devolve a geração da nova janela.
    pub fn open_window(&mut self) -> Option<u64> {
        if self.window_open {
            return None;
        }
        self.window_open = true;
        self.window_generation += 1;
        Some(self.window_generation)
    }

    /// Fecha a janela aberta. Com `generation`, só fecha se for a mesma janela.
    pub fn close_window(&mut self, generation: Option<u64>) -> bool {
        if !self.window_open || generation.is_some_and(|g| g != self.window_generation) {
            return false;
        }
        self.window_open = false;
        true
    }
}

fn hops_below(father_state: &NodeState) -> u32 {
    match father_state.role {
        Role::BaseStation => 0,
        Role::Ordinary => father_state.hop_count.saturating_add(1),
    }
}
