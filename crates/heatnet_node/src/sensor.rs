//! Sensor de temperatura e gerenciador de energia do host.

use heatnet_core::{SleepManager, TemperatureSensor};
use std::io;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use sysinfo::Components;
use tracing::debug;

/// Lê a temperatura da CPU pelos components do sysinfo.
pub struct HostSensor {
    components: Mutex<Components>,
}

impl HostSensor {
    pub fn new() -> Self {
        Self {
            components: Mutex::new(Components::new_with_refreshed_list()),
        }
    }
}

impl TemperatureSensor for HostSensor {
    fn read_celsius(&self) -> io::Result<f64> {
        let mut components = self
            .components
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        components.refresh(false);

        hottest_cpu_reading(components.iter().map(|c| (c.label(), c.temperature())))
            .map(f64::from)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "nenhum sensor térmico de CPU"))
    }
}

/// Maior leitura plausível entre os sensores com rótulo de CPU.
fn hottest_cpu_reading<'a>(readings: impl IntoIterator<Item = (&'a str, Option<f32>)>) -> Option<f32> {
    let mut hottest: Option<f32> = None;
    for (label, temp) in readings {
        let label = label.to_lowercase();
        let is_cpu = label.contains("cpu")
            || label.contains("tctl")
            || label.contains("tdie")
            || label.contains("package")
            || label.contains("core");
        if !is_cpu {
            continue;
        }
        if let Some(t) = temp.filter(|t| *t > 0.0 && *t < 150.0) {
            hottest = Some(hottest.map_or(t, |h| h.max(t)));
        }
    }
    hottest
}

/// "Baixo consumo" de um host: só bloqueia a thread.
pub struct ThreadSleeper {
    max: Duration,
}

impl ThreadSleeper {
    pub fn new(max: Duration) -> Self {
        Self { max }
    }
}

impl SleepManager for ThreadSleeper {
    fn enter_low_power(&self, duration: Duration) {
        let duration = duration.min(self.max);
        debug!("Dormindo por {:.1}s", duration.as_secs_f64());
        std::thread::sleep(duration);
    }

    fn max_low_power(&self) -> Duration {
        self.max
    }
}
