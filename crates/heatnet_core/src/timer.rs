//! Tarefas em background canceláveis.
//!
//! Cada tarefa roda numa thread nomeada e espera com `select!` entre o canal
//! de parada e o timer do crossbeam. Soltar o [`PeriodicTask`] (ou chamar
//! [`stop`](PeriodicTask::stop)) desconecta o canal de parada e a thread
//! termina no próximo ponto de espera. Parar nunca faz `join`, então uma
//! tarefa pode parar a si mesma de dentro do próprio callback.

use crossbeam_channel::{Receiver, Sender, after, bounded, select, tick};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;

/// O que a tarefa periódica faz após uma execução.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFlow {
    Continue,
    Stop,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Falha ao criar thread da tarefa {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Handle de uma tarefa atrasada ou periódica.
#[derive(Debug)]
pub struct PeriodicTask {
    name: String,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Executa `job` após `delay` e depois a cada `period`, até ser parada
    /// ou até `job` devolver [`TaskFlow::Stop`].
    pub fn spawn<F>(name: &str, delay: Duration, period: Duration, mut job: F) -> Result<Self, TaskError>
    where
        F: FnMut() -> TaskFlow + Send + 'static,
    {
        Self::start(name, move |stop_rx| {
            if !wait(&stop_rx, delay) {
                return;
            }
            let ticker = tick(period);
            loop {
                if job() == TaskFlow::Stop {
                    return;
                }
                select! {
                    recv(stop_rx) -> _ => return,
                    recv(ticker) -> _ => {}
                }
            }
        })
    }

    /// Executa `job` uma única vez após `delay`, se não for cancelada antes.
    pub fn once<F>(name: &str, delay: Duration, job: F) -> Result<Self, TaskError>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::start(name, move |stop_rx| {
            if wait(&stop_rx, delay) {
                job();
            }
        })
    }

    fn start<F>(name: &str, body: F) -> Result<Self, TaskError>
    where
        F: FnOnce(Receiver<()>) + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let thread = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || body(stop_rx))
            .map_err(|source| TaskError::Spawn {
                name: name.into(),
                source,
            })?;

        Ok(Self {
            name: name.into(),
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Cancela a tarefa. Parar uma tarefa já parada não faz nada.
    pub fn stop(&mut self) {
        if self.stop.take().is_some() {
            debug!("Tarefa {} parada", self.name);
        }
        self.thread = None;
    }

    /// A tarefa ainda não foi parada nem terminou sozinha.
    pub fn is_active(&self) -> bool {
        self.stop.is_some() && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Espera `delay` ou a parada. `true` se o tempo passou.
fn wait(stop_rx: &Receiver<()>, delay: Duration) -> bool {
    if delay.is_zero() {
        return stop_rx.try_recv().is_err_and(|e| e.is_empty());
    }
    select! {
        recv(stop_rx) -> _ => false,
        recv(after(delay)) -> _ => true,
    }
}
