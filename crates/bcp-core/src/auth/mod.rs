//! Battery authentication engine.
//!
//! One [`AuthDevice`] owns the BATC/BATD register pair and a worker thread.
//! Only one client command is admitted at a time; a second submission while
//! the first is running fails with [`Fault::Busy`].

pub mod command;
mod machine;
pub mod trust;

pub use command::{AuthCommand, AuthCommandId, AuthReply};
pub use trust::{Publication, TrustRecord};

use std::sync::Arc;
use std::sync::mpsc;

use tracing::info;

use crate::bus::{NotificationChannel, NotificationStatus, RegisterBus};
use crate::config::EngineConfig;
use crate::dispatch::{
    CommandDispatcher, Correlator, NotificationHook, NotificationPort, RegisterPair,
};
use crate::engine::{Callback, CommandEngine, Worker};
use crate::events::{DeviceKind, Diagnostic, EngineEvent, EngineObserver, NullObserver};
use crate::fault::Fault;
use crate::gate::BusyGate;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::properties::{AuthProperties, PropertyCell};
use crate::protocol::constants::{AUTH_COMMAND_KEY, AUTH_DATA_KEY, AUTH_DATA_LEN};

use machine::{AuthMachine, AuthRequest};

pub struct AuthDevice {
    worker: Worker<AuthRequest>,
    gate: Arc<BusyGate>,
    metrics: Arc<Metrics>,
    properties: PropertyCell<AuthProperties>,
}

impl AuthDevice {
    pub fn spawn(bus: Arc<dyn RegisterBus>, config: EngineConfig) -> Result<Self, Fault> {
        Self::with_observer(bus, config, Arc::new(NullObserver))
    }

    pub fn with_observer(
        bus: Arc<dyn RegisterBus>,
        config: EngineConfig,
        observer: Arc<dyn EngineObserver>,
    ) -> Result<Self, Fault> {
        let (tx, rx) = mpsc::channel();
        bus.register_notification_handler(
            NotificationChannel::BatteryAuth,
            NotificationPort::new(tx.clone()).into_handler(),
        )
        .map_err(|e| Fault::NoResources(format!("auth notification handler: {}", e)))?;

        let properties = PropertyCell::new(AuthProperties {
            trusted_data_enabled: config.auth.trusted_data_enabled,
            ..AuthProperties::default()
        });
        let metrics = Arc::new(Metrics::new());
        let gate = Arc::new(BusyGate::new());

        let hook = diagnostics_hook(properties.clone(), Arc::clone(&observer));
        let dispatcher = CommandDispatcher::new(
            bus,
            RegisterPair {
                command: AUTH_COMMAND_KEY,
                data: AUTH_DATA_KEY,
                data_len: AUTH_DATA_LEN,
            },
            config.retry.clone(),
            Arc::clone(&metrics),
            Correlator::new(rx, hook),
            config.auth.show_keys(),
        );

        info!(chip = %config.auth.chip, trusted_data = config.auth.trusted_data_enabled, "Starting auth engine");
        let machine = AuthMachine::new(
            dispatcher,
            config.auth,
            Arc::clone(&metrics),
            properties.clone(),
            observer,
            Arc::clone(&gate),
        );
        let worker = Worker::spawn("bcp-auth", tx, move || machine.run())?;

        Ok(Self {
            worker,
            gate,
            metrics,
            properties,
        })
    }

    /// Snapshot of the published trust and diagnostic values.
    pub fn properties(&self) -> AuthProperties {
        self.properties.snapshot()
    }

    pub fn is_busy(&self) -> bool {
        self.gate.is_held()
    }

    /// Submit a command in its raw client form (id plus optional data).
    pub fn submit_raw(
        &self,
        id: u8,
        data: Option<&[u8]>,
        callback: Callback<AuthCommandId, AuthReply>,
    ) -> Result<(), Fault> {
        let command = AuthCommand::decode(id, data)?;
        self.submit(command, callback)
    }
}

impl CommandEngine for AuthDevice {
    type Command = AuthCommand;
    type CommandId = AuthCommandId;
    type Reply = AuthReply;

    fn submit(
        &self,
        command: AuthCommand,
        callback: Callback<AuthCommandId, AuthReply>,
    ) -> Result<(), Fault> {
        if !self.gate.try_acquire() {
            return Err(Fault::Busy);
        }
        let posted = self.worker.post(AuthRequest { command, callback });
        if posted.is_err() {
            self.gate.release();
        }
        posted
    }

    fn report_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

/// Record the first bus and coprocessor failures seen in notifications.
fn diagnostics_hook(
    properties: PropertyCell<AuthProperties>,
    observer: Arc<dyn EngineObserver>,
) -> NotificationHook {
    Box::new(move |status: &NotificationStatus| {
        let mut raised = Vec::new();
        properties.update(|props| {
            if status.bus_status != 0 && props.note_communication_error(status.bus_status) {
                raised.push(Diagnostic::CommunicationError(status.bus_status));
            }
            if status.chip_status != 0 && props.note_coprocessor_error(status.chip_status) {
                raised.push(Diagnostic::CoprocessorError(status.chip_status));
            }
        });
        for diagnostic in raised {
            observer.on_event(&EngineEvent::DiagnosticRaised {
                device: DeviceKind::Auth,
                diagnostic,
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusError, MockBus};
    use crate::config::ChipVariant;
    use crate::events::tests::RecordingObserver;
    use crate::metrics::RetryChannel;
    use crate::protocol::AuthOp;
    use crate::protocol::constants::{
        GAUGE_CONTROL_KEY, GAUGE_READBACK_KEY, VERIDIAN_STATUS_BUSY, VERIDIAN_STATUS_OK,
    };
    use std::time::{Duration, Instant};

    type Outcome = crate::engine::CommandOutcome<AuthCommandId, AuthReply>;

    fn config(chip: ChipVariant) -> EngineConfig {
        let mut config = EngineConfig::fast();
        config.auth.chip = chip;
        config
    }

    fn device(bus: &MockBus, config: EngineConfig) -> AuthDevice {
        AuthDevice::spawn(Arc::new(bus.clone()), config).unwrap()
    }

    /// The gate is released after the callback, so a blocking `call` can
    /// return a moment before the device is idle again.
    fn wait_idle(device: &AuthDevice) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while device.is_busy() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn call(device: &AuthDevice, command: AuthCommand) -> Result<AuthReply, Fault> {
        let reply = device.call(command);
        wait_idle(device);
        reply
    }

    fn auth_ops(bus: &MockBus) -> Vec<u8> {
        bus.commands(NotificationChannel::BatteryAuth)
    }

    #[test]
    fn test_get_info_roswell() {
        let bus = MockBus::new();
        let mut info = vec![0u8; 64];
        info[0] = 3;
        info[4..8].copy_from_slice(&0x1122_3344u32.to_be_bytes());
        info[8..14].copy_from_slice(b"SN0001");
        bus.queue_response(AuthOp::GetInfo, &info);

        let dev = device(&bus, config(ChipVariant::Roswell));
        match call(&dev, AuthCommand::GetInfo).unwrap() {
            AuthReply::Info(info) => assert_eq!(info.serial(), b"SN0001"),
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(auth_ops(&bus), vec![0x01]);
    }

    #[test]
    fn test_second_submit_is_busy() {
        let bus = MockBus::new();
        bus.silence(AuthOp::GetCertSerial);
        let mut cfg = config(ChipVariant::Veridian);
        cfg.auth.completion_timeout_ms = 200;
        let dev = device(&bus, cfg);

        let (tx, rx) = mpsc::channel();
        dev.submit(
            AuthCommand::GetCertificateSerial,
            Box::new(move |outcome: Outcome| {
                let _ = tx.send(outcome);
            }),
        )
        .unwrap();

        let err = dev
            .submit(AuthCommand::GetInfo, Box::new(|_: Outcome| {}))
            .unwrap_err();
        assert_eq!(err, Fault::Busy);

        let outcome = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(outcome.command, AuthCommandId::GetCertificateSerial);
        assert!(outcome.result.is_ok());
        wait_idle(&dev);
        assert!(call(&dev, AuthCommand::GetInfo).is_ok());
    }

    #[test]
    fn test_certificate_reassembled_from_chunks() {
        for len in [64usize, 100, 609] {
            let bus = MockBus::new();
            bus.queue_response(AuthOp::GetCertLength, &(len as u16).to_le_bytes());
            let cert: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            for (i, chunk) in cert.chunks(64).enumerate() {
                bus.queue_response(AuthOp::GetCert(i as u8), chunk);
            }

            let dev = device(&bus, config(ChipVariant::Veridian));
            let reply = call(&dev, AuthCommand::GetCertificate).unwrap();
            assert_eq!(reply, AuthReply::Certificate(cert));

            let ops = auth_ops(&bus);
            assert_eq!(ops[0], 0x03);
            let expected: Vec<u8> = (0..len.div_ceil(64) as u8).map(|i| 0x10 + i).collect();
            assert_eq!(&ops[1..], expected.as_slice());
        }
    }

    #[test]
    fn test_oversized_certificate_rejected() {
        let bus = MockBus::new();
        bus.queue_response(AuthOp::GetCertLength, &610u16.to_le_bytes());
        let dev = device(&bus, config(ChipVariant::Veridian));

        let err = call(&dev, AuthCommand::GetCertificate).unwrap_err();
        assert!(matches!(err, Fault::Internal(_)));
        assert_eq!(auth_ops(&bus), vec![0x03]);
    }

    #[test]
    fn test_certificate_restarts_after_chunk_failure() {
        let bus = MockBus::new();
        bus.queue_response(AuthOp::GetCertLength, &100u16.to_le_bytes());
        bus.queue_status(AuthOp::GetCert(1), 0, 0x0001);
        let dev = device(&bus, config(ChipVariant::Veridian));

        let reply = call(&dev, AuthCommand::GetCertificate).unwrap();
        assert!(matches!(reply, AuthReply::Certificate(ref c) if c.len() == 100));
        assert_eq!(auth_ops(&bus), vec![0x03, 0x10, 0x11, 0x10, 0x11]);
        assert_eq!(
            dev.report_metrics().total_retries(RetryChannel::Certificate),
            1
        );
    }

    #[test]
    fn test_veridian_signature_and_trust_publication() {
        let bus = MockBus::new();
        bus.queue_response(AuthOp::GetStatus, &VERIDIAN_STATUS_BUSY.to_le_bytes());
        bus.queue_response(AuthOp::GetStatus, &VERIDIAN_STATUS_OK.to_le_bytes());
        bus.queue_response(AuthOp::GetNonce, &[0x5A; 32]);
        bus.queue_response(AuthOp::GetSignature, &[0xC3; 64]);

        let observer = Arc::new(RecordingObserver::default());
        let dev = AuthDevice::with_observer(
            Arc::new(bus.clone()),
            config(ChipVariant::Veridian),
            observer.clone(),
        )
        .unwrap();

        let reply = call(&dev, AuthCommand::GetSignature { challenge: [7; 32] }).unwrap();
        assert_eq!(
            reply,
            AuthReply::Signature {
                signature: [0xC3; 64],
                nonce: Some([0x5A; 32]),
            }
        );
        assert_eq!(auth_ops(&bus), vec![0x20, 0x23, 0x23, 0x21, 0x22]);
        assert_eq!(&bus.writes_to(AUTH_DATA_KEY)[0][..32], &[7; 32]);

        // Nothing is visible until the host hands down its verdict.
        let props = dev.properties();
        assert_eq!(props.auth_passed, None);
        assert_eq!(props.nonce, None);

        call(&dev, AuthCommand::SetTrustStatus { verdict: 1 }).unwrap();
        let props = dev.properties();
        assert_eq!(props.auth_passed, Some(true));
        assert_eq!(props.nonce, Some([0x5A; 32]));
        assert!(props.last_publication.is_some());
        assert_eq!(bus.writes_to(AUTH_DATA_KEY).last().unwrap()[0], 1);

        // Staging was consumed; a second pass has nothing to publish.
        call(&dev, AuthCommand::SetTrustStatus { verdict: 1 }).unwrap();
        let props = dev.properties();
        assert_eq!(props.auth_passed, Some(false));
        assert_eq!(props.nonce, None);

        let published: Vec<bool> = observer
            .events()
            .iter()
            .filter_map(|e| match e {
                EngineEvent::TrustPublished { passed, .. } => Some(*passed),
                _ => None,
            })
            .collect();
        assert_eq!(published, vec![true, false]);
    }

    #[test]
    fn test_signing_status_never_ready_times_out() {
        let bus = MockBus::new();
        bus.set_response(AuthOp::GetStatus, &VERIDIAN_STATUS_BUSY.to_le_bytes());
        let dev = device(&bus, config(ChipVariant::Veridian));

        let err = call(&dev, AuthCommand::GetSignature { challenge: [0; 32] }).unwrap_err();
        assert!(matches!(err, Fault::Timeout(_)));
        assert!(!auth_ops(&bus).contains(&0x22));
    }

    #[test]
    fn test_forced_trust_publishes_with_signature() {
        let bus = MockBus::new();
        bus.queue_response(AuthOp::GetStatus, &VERIDIAN_STATUS_OK.to_le_bytes());
        bus.queue_response(AuthOp::GetNonce, &[0x11; 32]);
        let mut cfg = config(ChipVariant::Veridian);
        cfg.auth.force_trust = true;
        let dev = device(&bus, cfg);

        call(&dev, AuthCommand::GetSignature { challenge: [1; 32] }).unwrap();
        let props = dev.properties();
        assert_eq!(props.auth_passed, Some(true));
        assert_eq!(props.nonce, Some([0x11; 32]));

        // A later failing verdict is still written but does not republish.
        call(&dev, AuthCommand::SetTrustStatus { verdict: 0 }).unwrap();
        assert_eq!(dev.properties().auth_passed, Some(true));
        assert_eq!(auth_ops(&bus).last(), Some(&0x24));
    }

    #[test]
    fn test_forced_trust_without_nonce_leaves_trust_untouched() {
        let bus = MockBus::new();
        bus.queue_response(AuthOp::GetSignature, &[0x3C; 64]);
        let mut cfg = config(ChipVariant::Roswell);
        cfg.auth.force_trust = true;
        cfg.auth.trusted_data_enabled = true;
        let observer = Arc::new(RecordingObserver::default());
        let dev = AuthDevice::with_observer(Arc::new(bus.clone()), cfg, observer.clone()).unwrap();

        let reply = call(&dev, AuthCommand::GetSignature { challenge: [2; 32] }).unwrap();
        assert_eq!(
            reply,
            AuthReply::Signature {
                signature: [0x3C; 64],
                nonce: None,
            }
        );
        call(&dev, AuthCommand::SetTrustStatus { verdict: 1 }).unwrap();

        let props = dev.properties();
        assert_eq!(props.auth_passed, None);
        assert_eq!(props.nonce, None);
        assert_eq!(props.last_publication, None);
        assert!(
            !observer
                .events()
                .iter()
                .any(|e| matches!(e, EngineEvent::TrustPublished { .. }))
        );
        assert_eq!(auth_ops(&bus), vec![0x20, 0x22, 0x24]);
    }

    #[test]
    fn test_missed_notification_still_reads_response() {
        let bus = MockBus::new();
        bus.silence(AuthOp::GetCertSerial);
        bus.queue_response(AuthOp::GetCertSerial, &[0x6E; 32]);
        let mut cfg = config(ChipVariant::Veridian);
        cfg.auth.completion_timeout_ms = 20;
        let dev = device(&bus, cfg);

        let reply = call(&dev, AuthCommand::GetCertificateSerial).unwrap();
        assert_eq!(reply, AuthReply::CertificateSerial([0x6E; 32]));
        assert_eq!(auth_ops(&bus), vec![0x02]);
        assert_eq!(
            dev.report_metrics().total_retries(RetryChannel::CertSerial),
            0
        );
    }

    #[test]
    fn test_panicking_callback_releases_gate() {
        let bus = MockBus::new();
        let dev = device(&bus, config(ChipVariant::Veridian));

        dev.submit(
            AuthCommand::GetCertificateSerial,
            Box::new(|_: Outcome| panic!("client callback failed")),
        )
        .unwrap();
        wait_idle(&dev);

        assert!(!dev.is_busy());
        assert!(call(&dev, AuthCommand::GetCertificateSerial).is_ok());
    }

    #[test]
    fn test_trusted_data_disabled_publishes_nothing() {
        let bus = MockBus::new();
        bus.queue_response(AuthOp::GetStatus, &VERIDIAN_STATUS_OK.to_le_bytes());
        let mut cfg = config(ChipVariant::Veridian);
        cfg.auth.trusted_data_enabled = false;
        let dev = device(&bus, cfg);

        call(&dev, AuthCommand::GetSignature { challenge: [1; 32] }).unwrap();
        call(&dev, AuthCommand::SetTrustStatus { verdict: 1 }).unwrap();
        let props = dev.properties();
        assert!(!props.trusted_data_enabled);
        assert_eq!(props.auth_passed, None);
        assert_eq!(props.nonce, None);
    }

    #[test]
    fn test_diagnostics_are_sticky() {
        let bus = MockBus::new();
        bus.queue_status(AuthOp::GetCertSerial, 0x02, 0);
        let observer = Arc::new(RecordingObserver::default());
        let dev = AuthDevice::with_observer(
            Arc::new(bus.clone()),
            config(ChipVariant::Veridian),
            observer.clone(),
        )
        .unwrap();

        let err = call(&dev, AuthCommand::GetCertificateSerial).unwrap_err();
        assert!(matches!(err, Fault::Protocol { .. }));

        bus.queue_status(AuthOp::GetCertSerial, 0x07, 0x0BAD);
        assert!(call(&dev, AuthCommand::GetCertificateSerial).is_err());

        let props = dev.properties();
        assert_eq!(props.communication_error, Some(0x02));
        assert_eq!(props.coprocessor_error, Some(0x0BAD));

        let raised = observer
            .events()
            .iter()
            .filter(|e| matches!(e, EngineEvent::DiagnosticRaised { .. }))
            .count();
        assert_eq!(raised, 2);
    }

    #[test]
    fn test_bus_failure_retries_command() {
        let bus = MockBus::new();
        bus.fail_writes(AUTH_COMMAND_KEY, vec![BusError::Timeout; 5]);
        bus.queue_response(AuthOp::GetCertSerial, &[0x42; 32]);
        let dev = device(&bus, config(ChipVariant::Veridian));

        let reply = call(&dev, AuthCommand::GetCertificateSerial).unwrap();
        assert_eq!(reply, AuthReply::CertificateSerial([0x42; 32]));

        let metrics = dev.report_metrics();
        let counters = metrics.channel(RetryChannel::CertSerial).unwrap();
        assert_eq!(counters.command_retries, 1);
        assert_eq!(counters.bus_retries, 5);
    }

    #[test]
    fn test_controller_resets_counted_across_retry() {
        let bus = MockBus::new();
        bus.fail_writes(AUTH_COMMAND_KEY, vec![BusError::AddressNotAck; 5]);
        bus.queue_register(GAUGE_READBACK_KEY, &7u16.to_le_bytes());
        bus.queue_register(GAUGE_READBACK_KEY, &9u16.to_le_bytes());
        let dev = device(&bus, config(ChipVariant::Roswell));

        call(&dev, AuthCommand::GetCertificateSerial).unwrap();
        assert_eq!(dev.report_metrics().controller_resets, 2);
        assert_eq!(bus.writes_to(GAUGE_CONTROL_KEY), vec![vec![0x05, 0x00]; 2]);
    }

    #[test]
    fn test_status_fault_is_not_retried() {
        let bus = MockBus::new();
        bus.queue_status(AuthOp::GetInfo, 0, 0x0001);
        let dev = device(&bus, config(ChipVariant::Roswell));

        assert!(call(&dev, AuthCommand::GetInfo).is_err());
        assert_eq!(auth_ops(&bus), vec![0x01]);
        assert_eq!(dev.report_metrics().total_retries(RetryChannel::Info), 0);
    }

    #[test]
    fn test_submit_raw_rejects_bad_lengths() {
        let bus = MockBus::new();
        let dev = device(&bus, config(ChipVariant::Roswell));
        let err = dev
            .submit_raw(3, Some(&[0; 16]), Box::new(|_: Outcome| {}))
            .unwrap_err();
        assert!(matches!(err, Fault::BadArgument(_)));
        assert!(!dev.is_busy());
        assert!(bus.get_writes().is_empty());
    }
}
