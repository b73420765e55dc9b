//! Control transfer engine
//!
//! Runs one request against endpoint 0 as the three-stage handshake:
//!
//! 1. SETUP: the 8-byte request, DATA0.
//! 2. DATA (when `wLength > 0`): max-packet chunks in the request's
//!    direction, starting at DATA1 and alternating; a short IN packet ends it.
//! 3. STATUS: zero-length DATA1 packet opposite to the data stage (IN when
//!    there is no data stage).
//!
//! Stall, NAK and timeout restart the whole transaction up to the retry
//! budget with a doubling backoff; disconnects, protocol errors and
//! cancellation fail immediately.
//!
//! Each device has one default pipe, so attempts against the same address
//! are serialized; different devices proceed in parallel.

use crate::config::EnumerationSettings;
use crate::lock;
use crate::transport::{HostController, Pid, Token};
use protocol::{DataToggle, DeviceRequest, DeviceSpeed, Direction, TransferError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Where a control transfer goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlTarget {
    pub address: u8,
    /// Endpoint 0 packet size
    pub max_packet: u16,
    pub speed: DeviceSpeed,
}

impl ControlTarget {
    /// A freshly reset device: address 0 and 8-byte packets until
    /// `bMaxPacketSize0` is known
    pub fn bootstrap(speed: DeviceSpeed) -> Self {
        Self {
            address: 0,
            max_packet: speed.bootstrap_max_packet(),
            speed,
        }
    }
}

/// Device addresses 0..=127
const PIPES: usize = 128;

pub struct ControlEngine {
    transport: Arc<dyn HostController>,
    /// One default pipe per address
    pipes: [Mutex<()>; PIPES],
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
}

impl ControlEngine {
    pub fn new(transport: Arc<dyn HostController>, settings: &EnumerationSettings) -> Self {
        Self {
            transport,
            pipes: std::array::from_fn(|_| Mutex::new(())),
            timeout: settings.control_timeout(),
            max_retries: settings.max_retries,
            backoff: settings.retry_backoff(),
        }
    }

    pub fn transport(&self) -> &Arc<dyn HostController> {
        &self.transport
    }

    /// Execute `request`, moving at most `data.len()` bytes
    ///
    /// `timeout` bounds each attempt; retries get a fresh deadline.
    pub fn execute(
        &self,
        target: &ControlTarget,
        request: &DeviceRequest,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransferError> {
        let mut backoff = self.backoff;
        let mut attempt = 0;
        loop {
            match self.attempt(target, request, data, timeout) {
                Ok(moved) => return Ok(moved),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    debug!(
                        "Control request {:#04x} to address {} failed ({}), retry {}/{}",
                        request.request, target.address, e, attempt, self.max_retries
                    );
                    if !backoff.is_zero() {
                        std::thread::sleep(backoff);
                    }
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Execute with the configured timeout
    pub fn execute_default(
        &self,
        target: &ControlTarget,
        request: &DeviceRequest,
        data: &mut [u8],
    ) -> Result<usize, TransferError> {
        self.execute(target, request, data, self.timeout)
    }

    /// IN request into a fresh `wLength` buffer, truncated to what arrived
    pub fn read(
        &self,
        target: &ControlTarget,
        request: &DeviceRequest,
    ) -> Result<Vec<u8>, TransferError> {
        let mut buf = vec![0u8; request.length as usize];
        let moved = self.execute_default(target, request, &mut buf)?;
        buf.truncate(moved);
        Ok(buf)
    }

    /// Request without a data stage
    pub fn write(
        &self,
        target: &ControlTarget,
        request: &DeviceRequest,
    ) -> Result<(), TransferError> {
        self.execute_default(target, request, &mut []).map(|_| ())
    }

    fn attempt(
        &self,
        target: &ControlTarget,
        request: &DeviceRequest,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransferError> {
        let _pipe = lock(&self.pipes[usize::from(target.address) % PIPES]);
        let deadline = Instant::now() + timeout;
        let remaining = || {
            deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
                .ok_or(TransferError::Timeout)
        };
        let token = |pid, toggle| Token {
            address: target.address,
            endpoint: 0,
            pid,
            toggle,
            max_packet: target.max_packet,
            speed: target.speed,
        };

        let length = (request.length as usize).min(data.len());
        let mut setup_request = *request;
        setup_request.length = length as u16;
        let direction = setup_request.direction();

        trace!(
            "SETUP addr={} type={:#04x} req={:#04x} value={:#06x} index={:#06x} len={}",
            target.address,
            setup_request.request_type.0,
            setup_request.request,
            setup_request.value,
            setup_request.index,
            length
        );
        let mut setup = setup_request.to_bytes();
        self.transport
            .transact(&token(Pid::Setup, DataToggle::Data0), &mut setup, remaining()?)?;

        let mut toggle = DataToggle::Data1;
        let mut moved = 0;
        if length > 0 {
            let pid = match direction {
                Direction::In => Pid::In,
                Direction::Out => Pid::Out,
            };
            let max_packet = usize::from(target.max_packet.max(1));
            while moved < length {
                let chunk = max_packet.min(length - moved);
                let n = self.transport.transact(
                    &token(pid, toggle),
                    &mut data[moved..moved + chunk],
                    remaining()?,
                )?;
                toggle.flip();
                moved += n;
                if n < chunk {
                    if pid == Pid::Out {
                        return Err(TransferError::Protocol(format!(
                            "short OUT packet: {} of {} bytes",
                            n, chunk
                        )));
                    }
                    break;
                }
            }
        }

        let status_pid = if length > 0 && direction == Direction::In {
            Pid::Out
        } else {
            Pid::In
        };
        self.transport
            .transact(&token(status_pid, DataToggle::Data1), &mut [], remaining()?)?;

        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::PortStatus;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Records every token and replays scripted results
    #[derive(Default)]
    struct ScriptedTransport {
        log: Mutex<Vec<(Pid, DataToggle, usize)>>,
        script: Mutex<VecDeque<Result<usize, TransferError>>>,
        fill: u8,
    }

    impl ScriptedTransport {
        fn with_script(script: Vec<Result<usize, TransferError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fill: 0xAB,
                ..Default::default()
            })
        }

        fn log(&self) -> Vec<(Pid, DataToggle, usize)> {
            self.log.lock().unwrap().clone()
        }
    }

    impl HostController for ScriptedTransport {
        fn name(&self) -> &str {
            "scripted"
        }
        fn start(&self) -> Result<(), TransferError> {
            Ok(())
        }
        fn stop(&self) -> Result<(), TransferError> {
            Ok(())
        }
        fn reset(&self) -> Result<(), TransferError> {
            Ok(())
        }
        fn poll(&self) -> Vec<u8> {
            Vec::new()
        }
        fn root_port_count(&self) -> u8 {
            1
        }
        fn root_port_status(&self, _port: u8) -> Result<PortStatus, TransferError> {
            Ok(PortStatus::default())
        }
        fn set_root_port_feature(&self, _port: u8, _feature: u16) -> Result<(), TransferError> {
            Ok(())
        }
        fn clear_root_port_feature(&self, _port: u8, _feature: u16) -> Result<(), TransferError> {
            Ok(())
        }
        fn transact(
            &self,
            token: &Token,
            data: &mut [u8],
            _timeout: Duration,
        ) -> Result<usize, TransferError> {
            self.log
                .lock()
                .unwrap()
                .push((token.pid, token.toggle, data.len()));
            let result = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(data.len()));
            if let Ok(n) = result {
                if token.pid == Pid::In {
                    data[..n].fill(self.fill);
                }
            }
            result
        }
        fn cancel_all(&self) {}
    }

    fn engine(transport: Arc<ScriptedTransport>, retries: u32) -> ControlEngine {
        let settings = EnumerationSettings {
            max_retries: retries,
            ..EnumerationSettings::immediate()
        };
        ControlEngine::new(transport, &settings)
    }

    #[test]
    fn test_in_request_chunks_and_toggles() {
        let transport = ScriptedTransport::with_script(vec![]);
        let engine = engine(transport.clone(), 0);
        let target = ControlTarget::bootstrap(DeviceSpeed::Full);

        let data = engine
            .read(&target, &DeviceRequest::get_device_descriptor(18))
            .unwrap();
        assert_eq!(data.len(), 18);

        let log = transport.log();
        assert_eq!(
            log,
            vec![
                (Pid::Setup, DataToggle::Data0, 8),
                (Pid::In, DataToggle::Data1, 8),
                (Pid::In, DataToggle::Data0, 8),
                (Pid::In, DataToggle::Data1, 2),
                (Pid::Out, DataToggle::Data1, 0),
            ]
        );
    }

    #[test]
    fn test_short_packet_ends_data_stage() {
        // 64-byte request, device only has 18 bytes: 8 + 8 + 2
        let transport =
            ScriptedTransport::with_script(vec![Ok(8), Ok(8), Ok(8), Ok(2), Ok(0)]);
        let engine = engine(transport.clone(), 0);
        let target = ControlTarget::bootstrap(DeviceSpeed::Full);

        let data = engine
            .read(&target, &DeviceRequest::get_device_descriptor(64))
            .unwrap();
        assert_eq!(data.len(), 18);
        assert_eq!(transport.log().last(), Some(&(Pid::Out, DataToggle::Data1, 0)));
    }

    #[test]
    fn test_no_data_stage_status_is_in() {
        let transport = ScriptedTransport::with_script(vec![]);
        let engine = engine(transport.clone(), 0);
        let target = ControlTarget::bootstrap(DeviceSpeed::High);

        engine
            .write(&target, &DeviceRequest::set_address(5))
            .unwrap();
        assert_eq!(
            transport.log(),
            vec![
                (Pid::Setup, DataToggle::Data0, 8),
                (Pid::In, DataToggle::Data1, 0),
            ]
        );
    }

    #[test]
    fn test_stall_retried_then_succeeds() {
        // First attempt stalls in the status stage
        let transport = ScriptedTransport::with_script(vec![Ok(8), Err(TransferError::Stall)]);
        let engine = engine(transport.clone(), 2);
        let target = ControlTarget::bootstrap(DeviceSpeed::Full);

        engine
            .write(&target, &DeviceRequest::set_configuration(1))
            .unwrap();
        assert_eq!(transport.log().len(), 4);
    }

    #[test]
    fn test_retry_budget_is_bounded() {
        let script = (0..10).map(|_| Err(TransferError::Nak)).collect();
        let transport = ScriptedTransport::with_script(script);
        let engine = engine(transport.clone(), 3);
        let target = ControlTarget::bootstrap(DeviceSpeed::Full);

        let err = engine
            .write(&target, &DeviceRequest::set_configuration(1))
            .unwrap_err();
        assert_eq!(err, TransferError::Nak);
        // One attempt plus three retries, each dying at SETUP
        assert_eq!(transport.log().len(), 4);
    }

    #[test]
    fn test_disconnect_not_retried() {
        let transport =
            ScriptedTransport::with_script(vec![Ok(8), Err(TransferError::Disconnected)]);
        let engine = engine(transport.clone(), 3);
        let target = ControlTarget::bootstrap(DeviceSpeed::Full);

        let err = engine
            .read(&target, &DeviceRequest::get_device_descriptor(8))
            .unwrap_err();
        assert_eq!(err, TransferError::Disconnected);
        assert_eq!(transport.log().len(), 2);
    }

    #[test]
    fn test_zero_timeout_fails_with_timeout() {
        let transport = ScriptedTransport::with_script(vec![]);
        let engine = engine(transport.clone(), 0);
        let target = ControlTarget::bootstrap(DeviceSpeed::Full);

        let err = engine
            .execute(
                &target,
                &DeviceRequest::set_address(1),
                &mut [],
                Duration::ZERO,
            )
            .unwrap_err();
        assert_eq!(err, TransferError::Timeout);
        assert!(transport.log().is_empty());
    }

    #[test]
    fn test_wlength_clamped_to_buffer() {
        let transport = ScriptedTransport::with_script(vec![]);
        let engine = engine(transport.clone(), 0);
        let target = ControlTarget::bootstrap(DeviceSpeed::Full);

        let mut buf = [0u8; 4];
        let n = engine
            .execute_default(&target, &DeviceRequest::get_device_descriptor(18), &mut buf)
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf, [0xAB; 4]);
    }
}
