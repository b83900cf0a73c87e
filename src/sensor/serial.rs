//! Serial transducer channel.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{PressureReading, PressureSensorChannel, SensorError, SensorProtocol, SensorSample};
use crate::cell::LatestCell;
use crate::units::PressureUnit;

/// Line speed of the transducer. Frames are 8 data bits, no parity, 1 stop bit.
pub const BAUD_RATE: u32 = 9600;

/// Low-level I/O failure with an OS-style code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkError {
    pub code: i32,
    pub message: String,
}

impl LinkError {
    fn from_io(err: &std::io::Error) -> Self {
        let code = err.raw_os_error().unwrap_or(match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => 0,
            _ => -1,
        });
        Self {
            code,
            message: err.to_string(),
        }
    }
}

/// Byte transport under a [`SerialSensorChannel`].
pub trait SerialLink: Send {
    /// Write once, returning how many bytes went out.
    fn write(&mut self, data: &[u8]) -> Result<usize, LinkError>;

    /// Read what is available. `Ok(0)` or a timeout error means nothing arrived.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError>;
}

impl SerialLink for Box<dyn serialport::SerialPort> {
    fn write(&mut self, data: &[u8]) -> Result<usize, LinkError> {
        let sent = Write::write(self, data).map_err(|e| LinkError::from_io(&e))?;
        self.flush().map_err(|e| LinkError::from_io(&e))?;
        Ok(sent)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        Read::read(self, buf).map_err(|e| LinkError::from_io(&e))
    }
}

/// Polling cadence and failure handling.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Time between the starts of two cycles.
    pub interval: Duration,
    /// Read timeout applied to the port.
    pub read_timeout: Duration,
    /// Consecutive decode failures before the error escalates to
    /// [`SensorError::IndexOutOfRange`].
    pub decode_failure_limit: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(80),
            read_timeout: Duration::from_millis(500),
            decode_failure_limit: 10,
        }
    }
}

impl PollingConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_decode_failure_limit(mut self, limit: u32) -> Self {
        self.decode_failure_limit = limit.max(1);
        self
    }
}

/// Run one request/response exchange.
pub(crate) fn poll_once(
    link: &mut dyn SerialLink,
    protocol: &SensorProtocol,
    port: &str,
) -> Result<(f64, PressureUnit), SensorError> {
    let total = protocol.request.len();
    let sent = link
        .write(&protocol.request)
        .map_err(|e| SensorError::WriteFailed {
            port: port.to_string(),
            sent: 0,
            total,
            code: e.code,
        })?;
    if sent < total {
        return Err(SensorError::WriteFailed {
            port: port.to_string(),
            sent,
            total,
            code: 0,
        });
    }

    let mut frame = vec![0u8; protocol.response_length];
    let mut got = 0;
    while got < frame.len() {
        match link.read(&mut frame[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(e) if got == 0 => {
                return Err(SensorError::ReadFailed {
                    port: port.to_string(),
                    code: e.code,
                })
            }
            Err(_) => break,
        }
    }
    if got == 0 {
        return Err(SensorError::ReadFailed {
            port: port.to_string(),
            code: 0,
        });
    }
    protocol.decode(port, &frame[..got])
}

struct PollWorker {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<Box<dyn SerialLink>>,
}

/// Transducer on a serial port.
///
/// Polling runs on a dedicated thread that owns the link while it runs; the
/// link comes back to the channel when polling stops.
pub struct SerialSensorChannel {
    protocol: SensorProtocol,
    config: PollingConfig,
    port: Option<String>,
    // Idle link; the mutex only makes the channel shareable.
    link: Option<Mutex<Box<dyn SerialLink>>>,
    worker: Option<PollWorker>,
    samples: LatestCell<SensorSample>,
}

impl SerialSensorChannel {
    pub fn new(protocol: SensorProtocol, config: PollingConfig) -> Self {
        Self {
            protocol,
            config,
            port: None,
            link: None,
            worker: None,
            samples: LatestCell::new(),
        }
    }

    pub fn protocol(&self) -> &SensorProtocol {
        &self.protocol
    }

    /// Attach an already open transport under the given port name.
    pub fn connect_link(
        &mut self,
        port: &str,
        link: Box<dyn SerialLink>,
    ) -> Result<(), SensorError> {
        if port.trim().is_empty() {
            return Err(SensorError::EmptyPort);
        }
        if self.is_connected() {
            return Err(SensorError::AlreadyOpen {
                port: port.to_string(),
            });
        }
        self.link = Some(Mutex::new(link));
        self.port = Some(port.to_string());
        info!("Sensor port {} opened", port);
        Ok(())
    }

    fn open_port(&self, port: &str) -> Result<Box<dyn serialport::SerialPort>, SensorError> {
        let mut handle = serialport::new(port, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(self.config.read_timeout)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::InvalidInput => SensorError::ConfigureFailed {
                    port: port.to_string(),
                    reason: e.description.clone(),
                },
                kind => SensorError::PortOpenFailed {
                    port: port.to_string(),
                    code: open_error_code(kind),
                },
            })?;

        handle
            .set_timeout(self.config.read_timeout)
            .and_then(|_| handle.clear(serialport::ClearBuffer::All))
            .map_err(|e| SensorError::ConfigureFailed {
                port: port.to_string(),
                reason: e.description,
            })?;
        Ok(handle)
    }
}

/// errno-style code for a failed open.
fn open_error_code(kind: serialport::ErrorKind) -> i32 {
    match kind {
        serialport::ErrorKind::NoDevice => 2,
        serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => 2,
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => 13,
        serialport::ErrorKind::Io(std::io::ErrorKind::AddrInUse) => 16,
        _ => -1,
    }
}

impl PressureSensorChannel for SerialSensorChannel {
    fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }

    fn is_stub(&self) -> bool {
        false
    }

    fn is_connected(&self) -> bool {
        self.link.is_some() || self.worker.is_some()
    }

    fn connect(&mut self, port: &str) -> Result<(), SensorError> {
        if port.trim().is_empty() {
            return Err(SensorError::EmptyPort);
        }
        if self.is_connected() {
            return Err(SensorError::AlreadyOpen {
                port: self.port.clone().unwrap_or_else(|| port.to_string()),
            });
        }
        let handle = self.open_port(port)?;
        self.connect_link(port, Box::new(handle))
    }

    fn start_polling(&mut self) -> Result<(), SensorError> {
        let port = self.port.clone().ok_or(SensorError::NotConnected)?;
        if self.worker.is_some() {
            return Err(SensorError::AlreadyPolling { port });
        }
        self.protocol.validate(&port)?;
        let link = self
            .link
            .take()
            .ok_or(SensorError::NotConnected)?
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let stop = Arc::new(AtomicBool::new(false));
        let samples = self.samples.clone();
        let protocol = self.protocol.clone();
        let config = self.config.clone();
        let worker_stop = stop.clone();
        let worker_port = port.clone();
        let thread = thread::Builder::new()
            .name(format!("sensor-poll-{}", port))
            .spawn(move || poll_loop(link, protocol, config, worker_port, samples, worker_stop))
            .map_err(|e| SensorError::ConfigureFailed {
                port: port.clone(),
                reason: format!("cannot start polling thread: {}", e),
            })?;

        self.worker = Some(PollWorker { stop, thread });
        info!(
            "Polling {} every {}ms",
            port,
            self.config.interval.as_millis()
        );
        Ok(())
    }

    fn is_polling(&self) -> bool {
        self.worker.is_some()
    }

    fn stop_polling(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.stop.store(true, Ordering::SeqCst);
        match worker.thread.join() {
            Ok(link) => self.link = Some(Mutex::new(link)),
            Err(_) => error!("Sensor polling thread panicked; port released"),
        }
        info!("Polling stopped on {}", self.port.as_deref().unwrap_or("-"));
    }

    fn disconnect(&mut self) {
        self.stop_polling();
        if self.link.take().is_some() {
            info!("Sensor port {} closed", self.port.as_deref().unwrap_or("-"));
        }
        self.port = None;
    }

    fn subscribe(&self) -> watch::Receiver<Option<SensorSample>> {
        self.samples.subscribe()
    }
}

impl Drop for SerialSensorChannel {
    fn drop(&mut self) {
        self.stop_polling();
    }
}

fn poll_loop(
    mut link: Box<dyn SerialLink>,
    protocol: SensorProtocol,
    config: PollingConfig,
    port: String,
    samples: LatestCell<SensorSample>,
    stop: Arc<AtomicBool>,
) -> Box<dyn SerialLink> {
    let mut previous: Option<PressureReading> = None;
    let mut sequence = 0u64;
    let mut decode_failures = 0u32;

    while !stop.load(Ordering::SeqCst) {
        let started = std::time::Instant::now();
        let sample = match poll_once(link.as_mut(), &protocol, &port) {
            Ok((value, unit)) => {
                if decode_failures > 0 {
                    info!("Sensor on {} recovered", port);
                }
                decode_failures = 0;
                sequence += 1;
                let reading = PressureReading::new(value, unit, sequence, previous.as_ref());
                previous = Some(reading);
                Ok(reading)
            }
            Err(e) if e.is_decode_failure() => {
                decode_failures += 1;
                if decode_failures >= config.decode_failure_limit {
                    warn!("{} consecutive bad frames on {}: {}", decode_failures, port, e);
                    Err(SensorError::IndexOutOfRange {
                        port: port.clone(),
                        detail: format!("{} consecutive bad frames, last: {}", decode_failures, e),
                    })
                } else {
                    debug!("Bad frame on {}: {}", port, e);
                    Err(e)
                }
            }
            Err(e) => {
                warn!("Sensor exchange failed: {}", e);
                Err(e)
            }
        };
        samples.publish(sample);

        let elapsed = started.elapsed();
        if elapsed < config.interval {
            thread::sleep(config.interval - elapsed);
        }
    }
    link
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays one scripted response per request.
    struct ScriptedLink {
        accept: usize,
        responses: VecDeque<Vec<u8>>,
        pending: Vec<u8>,
        repeat_last: bool,
        last: Vec<u8>,
    }

    impl ScriptedLink {
        fn new(responses: Vec<Vec<u8>>) -> Self {
            Self {
                accept: usize::MAX,
                responses: responses.into(),
                pending: Vec::new(),
                repeat_last: false,
                last: Vec::new(),
            }
        }
    }

    impl SerialLink for ScriptedLink {
        fn write(&mut self, data: &[u8]) -> Result<usize, LinkError> {
            let next = self.responses.pop_front();
            self.pending = match next {
                Some(frame) => {
                    self.last = frame.clone();
                    frame
                }
                None if self.repeat_last => self.last.clone(),
                None => Vec::new(),
            };
            Ok(data.len().min(self.accept))
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
            if self.pending.is_empty() {
                return Err(LinkError {
                    code: 0,
                    message: "timed out".to_string(),
                });
            }
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    fn frame(unit: u8, value: f32) -> Vec<u8> {
        let le = value.to_le_bytes();
        vec![unit, le[3], le[2], le[1], le[0]]
    }

    fn fast_config() -> PollingConfig {
        PollingConfig::default().with_interval(Duration::from_millis(5))
    }

    fn wait_for<F: Fn(&SensorSample) -> bool>(channel: &SerialSensorChannel, f: F) -> SensorSample {
        for _ in 0..400 {
            if let Some(sample) = channel.latest() {
                if f(&sample) {
                    return sample;
                }
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("no matching sample published");
    }

    #[test]
    fn test_poll_once_decodes_frame() {
        let mut link = ScriptedLink::new(vec![frame(9, 1.5)]);
        let result = poll_once(&mut link, &SensorProtocol::default(), "COM3").unwrap();
        assert_eq!(result, (1.5, PressureUnit::Bar));
    }

    #[test]
    fn test_poll_once_partial_write() {
        let protocol = SensorProtocol::default().with_request(vec![0x01, 0x03, 0x00, 0x00, 0x02]);
        let mut link = ScriptedLink::new(vec![frame(1, 1.0)]);
        link.accept = 3;
        assert_eq!(
            poll_once(&mut link, &protocol, "COM3"),
            Err(SensorError::WriteFailed {
                port: "COM3".to_string(),
                sent: 3,
                total: 5,
                code: 0
            })
        );
    }

    #[test]
    fn test_poll_once_read_failures() {
        let protocol = SensorProtocol::default();
        let mut silent = ScriptedLink::new(vec![]);
        assert!(matches!(
            poll_once(&mut silent, &protocol, "COM3"),
            Err(SensorError::ReadFailed { code: 0, .. })
        ));

        let mut short = ScriptedLink::new(vec![vec![1, 2]]);
        assert!(matches!(
            poll_once(&mut short, &protocol, "COM3"),
            Err(SensorError::UnexpectedLength {
                got: 2,
                expected: 5,
                ..
            })
        ));
    }

    #[test]
    fn test_connect_preconditions() {
        let mut channel = SerialSensorChannel::new(SensorProtocol::default(), fast_config());
        assert_eq!(channel.connect(""), Err(SensorError::EmptyPort));
        assert_eq!(channel.start_polling(), Err(SensorError::NotConnected));

        channel
            .connect_link("COM3", Box::new(ScriptedLink::new(vec![])))
            .unwrap();
        assert!(matches!(
            channel.connect_link("COM3", Box::new(ScriptedLink::new(vec![]))),
            Err(SensorError::AlreadyOpen { .. })
        ));
        assert!(!channel.is_stub());
        assert_eq!(channel.port(), Some("COM3"));
    }

    #[test]
    fn test_polling_publishes_and_recovers() {
        let mut link = ScriptedLink::new(vec![vec![1, 2], frame(3, 250.0)]);
        link.repeat_last = true;
        let mut channel = SerialSensorChannel::new(SensorProtocol::default(), fast_config());
        channel.connect_link("COM3", Box::new(link)).unwrap();
        channel.start_polling().unwrap();
        assert!(channel.is_polling());
        assert!(matches!(
            channel.start_polling(),
            Err(SensorError::AlreadyPolling { .. })
        ));

        let sample = wait_for(&channel, |s| s.is_ok());
        let reading = sample.unwrap();
        assert_eq!(reading.value, 250.0);
        assert_eq!(reading.unit, PressureUnit::KPa);

        channel.stop_polling();
        channel.stop_polling();
        assert!(!channel.is_polling());
        assert!(channel.is_connected());
        channel.disconnect();
        channel.disconnect();
        assert!(!channel.is_connected());
    }

    #[test]
    fn test_decode_failures_escalate() {
        let mut link = ScriptedLink::new(vec![frame(77, 1.0)]);
        link.repeat_last = true;
        let config = fast_config().with_decode_failure_limit(3);
        let mut channel = SerialSensorChannel::new(SensorProtocol::default(), config);
        channel.connect_link("COM3", Box::new(link)).unwrap();
        channel.start_polling().unwrap();

        let sample = wait_for(&channel, |s| {
            matches!(s, Err(SensorError::IndexOutOfRange { .. }))
        });
        assert!(sample.is_err());
        channel.disconnect();
    }

    #[test]
    fn test_bad_offsets_refuse_to_poll() {
        let protocol = SensorProtocol::default().with_response_length(3);
        let mut channel = SerialSensorChannel::new(protocol, fast_config());
        channel
            .connect_link("COM3", Box::new(ScriptedLink::new(vec![])))
            .unwrap();
        assert!(matches!(
            channel.start_polling(),
            Err(SensorError::IndexOutOfRange { .. })
        ));
        assert!(!channel.is_polling());
    }
}
