//! Stub transducer that reads the simulated rig.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::SimulatedRig;
use crate::cell::LatestCell;
use crate::sensor::{PressureReading, PressureSensorChannel, SensorError, SensorSample};

/// Sensor channel publishing the rig pressure on a tokio interval.
pub struct SimulatedSensorChannel {
    rig: SimulatedRig,
    interval: Duration,
    port: Option<String>,
    task: Option<JoinHandle<()>>,
    fault: Arc<Mutex<Option<SensorError>>>,
    stalled: Arc<AtomicBool>,
    samples: LatestCell<SensorSample>,
}

impl SimulatedSensorChannel {
    pub fn new(rig: SimulatedRig, interval: Duration) -> Self {
        Self {
            rig,
            interval,
            port: None,
            task: None,
            fault: Arc::new(Mutex::new(None)),
            stalled: Arc::new(AtomicBool::new(false)),
            samples: LatestCell::new(),
        }
    }

    /// Publish `error` every cycle until [`clear_fault`](Self::clear_fault).
    pub fn inject_fault(&self, error: SensorError) {
        warn!("Injected sensor fault: {}", error);
        *self.fault.lock().unwrap_or_else(|p| p.into_inner()) = Some(error);
    }

    /// Clear injected errors and resume publishing after a stall.
    pub fn clear_fault(&self) {
        self.fault_injector().clear();
    }

    /// Clonable fault switch for other tasks.
    pub fn fault_injector(&self) -> FaultInjector {
        FaultInjector {
            fault: self.fault.clone(),
            stalled: self.stalled.clone(),
        }
    }
}

/// Shared handle to a simulated channel's fault slot.
#[derive(Clone)]
pub struct FaultInjector {
    fault: Arc<Mutex<Option<SensorError>>>,
    stalled: Arc<AtomicBool>,
}

impl FaultInjector {
    pub fn inject(&self, error: SensorError) {
        *self.fault.lock().unwrap_or_else(|p| p.into_inner()) = Some(error);
    }

    /// Stop publishing; the last sample stays in place and ages.
    pub fn stall(&self) {
        warn!("Stub sensor stalled");
        self.stalled.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        *self.fault.lock().unwrap_or_else(|p| p.into_inner()) = None;
        self.stalled.store(false, Ordering::SeqCst);
    }
}

impl PressureSensorChannel for SimulatedSensorChannel {
    fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }

    fn is_stub(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn connect(&mut self, port: &str) -> Result<(), SensorError> {
        if port.trim().is_empty() {
            return Err(SensorError::EmptyPort);
        }
        if let Some(open) = &self.port {
            return Err(SensorError::AlreadyOpen { port: open.clone() });
        }
        self.port = Some(port.to_string());
        info!("Stub sensor attached as {}", port);
        Ok(())
    }

    fn start_polling(&mut self) -> Result<(), SensorError> {
        let port = self.port.clone().ok_or(SensorError::NotConnected)?;
        if self.task.is_some() {
            return Err(SensorError::AlreadyPolling { port });
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|e| SensorError::ConfigureFailed {
                port: port.clone(),
                reason: format!("stub sensor needs an async runtime: {}", e),
            })?;

        let rig = self.rig.clone();
        let fault = self.fault.clone();
        let stalled = self.stalled.clone();
        let samples = self.samples.clone();
        let period = self.interval;
        self.task = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut previous: Option<PressureReading> = None;
            let mut sequence = 0u64;
            loop {
                ticker.tick().await;
                if stalled.load(Ordering::SeqCst) {
                    continue;
                }
                let injected = fault.lock().unwrap_or_else(|p| p.into_inner()).clone();
                let sample = match injected {
                    Some(error) => Err(error),
                    None => {
                        sequence += 1;
                        let reading = PressureReading::new(
                            rig.pressure(),
                            rig.unit(),
                            sequence,
                            previous.as_ref(),
                        );
                        previous = Some(reading);
                        Ok(reading)
                    }
                };
                samples.publish(sample);
            }
        }));
        info!("Stub sensor polling every {}ms", period.as_millis());
        Ok(())
    }

    fn is_polling(&self) -> bool {
        self.task.is_some()
    }

    fn stop_polling(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("Stub sensor polling stopped");
        }
    }

    fn disconnect(&mut self) {
        self.stop_polling();
        self.port = None;
    }

    fn subscribe(&self) -> watch::Receiver<Option<SensorSample>> {
        self.samples.subscribe()
    }
}

impl Drop for SimulatedSensorChannel {
    fn drop(&mut self) {
        self.stop_polling();
    }
}
