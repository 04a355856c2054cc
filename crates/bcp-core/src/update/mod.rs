//! Gas gauge firmware update engine.
//!
//! Owns the BFUC/BFUD register pair. Requests queue on the worker mailbox
//! and run one at a time; a session is StartUpdate, any number of SendData
//! artifacts, then CommitImage.

pub mod artifact;
pub mod command;
mod machine;
pub mod state;

pub use artifact::{Artifact, ArtifactError, ArtifactKind, ChunkIterator, ImageKind, ImageSet};
pub use command::{UpdateCommand, UpdateCommandId, UpdateReply};
pub use state::UpdateState;

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
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::properties::{PropertyCell, UpdaterProperties};
use crate::protocol::UpdaterStatus;
use crate::protocol::constants::{UPDATE_COMMAND_KEY, UPDATE_DATA_KEY, UPDATE_DATA_LEN};

use machine::{UpdateMachine, UpdateRequest};

pub struct UpdateDevice {
    worker: Worker<UpdateRequest>,
    metrics: Arc<Metrics>,
    properties: PropertyCell<UpdaterProperties>,
    state: PropertyCell<UpdateState>,
}

impl UpdateDevice {
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
            NotificationChannel::GasGaugeUpdate,
            NotificationPort::new(tx.clone()).into_handler(),
        )
        .map_err(|e| Fault::NoResources(format!("update notification handler: {}", e)))?;

        let properties = PropertyCell::new(UpdaterProperties::default());
        let state = PropertyCell::new(UpdateState::Idle);
        let metrics = Arc::new(Metrics::new());

        let hook = diagnostics_hook(properties.clone(), Arc::clone(&observer));
        let dispatcher = CommandDispatcher::new(
            bus,
            RegisterPair {
                command: UPDATE_COMMAND_KEY,
                data: UPDATE_DATA_KEY,
                data_len: UPDATE_DATA_LEN,
            },
            config.retry.clone(),
            Arc::clone(&metrics),
            Correlator::new(rx, hook),
            config.update.display_keys,
        );

        info!("Starting firmware update engine");
        let machine = UpdateMachine::new(
            dispatcher,
            config.update,
            properties.clone(),
            state.clone(),
            observer,
        );
        let worker = Worker::spawn("bcp-update", tx, move || machine.run())?;

        Ok(Self {
            worker,
            metrics,
            properties,
            state,
        })
    }

    pub fn properties(&self) -> UpdaterProperties {
        self.properties.snapshot()
    }

    /// Current session state.
    pub fn state(&self) -> UpdateState {
        self.state.snapshot()
    }

    /// Submit a command in its raw client form.
    pub fn submit_raw(
        &self,
        id: u8,
        data: Option<&[u8]>,
        callback: Callback<UpdateCommandId, UpdateReply>,
    ) -> Result<(), Fault> {
        let command = UpdateCommand::decode(id, data)?;
        self.submit(command, callback)
    }
}

impl CommandEngine for UpdateDevice {
    type Command = UpdateCommand;
    type CommandId = UpdateCommandId;
    type Reply = UpdateReply;

    fn submit(
        &self,
        command: UpdateCommand,
        callback: Callback<UpdateCommandId, UpdateReply>,
    ) -> Result<(), Fault> {
        self.worker.post(UpdateRequest { command, callback })
    }

    fn report_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

fn diagnostics_hook(
    properties: PropertyCell<UpdaterProperties>,
    observer: Arc<dyn EngineObserver>,
) -> NotificationHook {
    Box::new(move |status: &NotificationStatus| {
        let mut raised = Vec::new();
        if status.bus_status != 0 {
            properties.update(|props| props.communication_error = Some(status.bus_status));
            raised.push(Diagnostic::CommunicationError(status.bus_status));
        }
        if UpdaterStatus::from_u16(status.chip_status).is_error() {
            properties.update(|props| props.updater_status = Some(status.chip_status));
            raised.push(Diagnostic::UpdaterStatus(status.chip_status));
        }
        for diagnostic in raised {
            observer.on_event(&EngineEvent::DiagnosticRaised {
                device: DeviceKind::Updater,
                diagnostic,
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBus;
    use crate::events::tests::RecordingObserver;
    use crate::protocol::UpdateOp;
    use std::time::Duration;

    type Outcome = crate::engine::CommandOutcome<UpdateCommandId, UpdateReply>;

    const READY: [u8; 2] = [1, 0];
    const BUSY: [u8; 2] = [2, 0];
    const SUCCESS: [u8; 2] = [3, 0];

    fn info2(two_stage: bool) -> Vec<u8> {
        let mut buf = vec![0u8; UPDATE_DATA_LEN];
        buf[..4].copy_from_slice(&0x0000_BEEFu32.to_le_bytes());
        buf[6] = u8::from(two_stage);
        buf
    }

    fn device(bus: &MockBus) -> UpdateDevice {
        UpdateDevice::spawn(Arc::new(bus.clone()), EngineConfig::fast()).unwrap()
    }

    fn ops(bus: &MockBus) -> Vec<u8> {
        bus.commands(NotificationChannel::GasGaugeUpdate)
    }

    fn start_session(bus: &MockBus, dev: &UpdateDevice, two_stage: bool) {
        bus.queue_response(UpdateOp::GetInfo2, &info2(two_stage));
        bus.queue_response(UpdateOp::GetUid, &0xCAFE_BABEu32.to_le_bytes());
        bus.queue_response(UpdateOp::GetNonce, &[0x33; 32]);
        dev.call(UpdateCommand::StartUpdate).unwrap();
        bus.clear_log();
    }

    #[test]
    fn test_start_update_flow() {
        let bus = MockBus::new();
        bus.set_response(UpdateOp::GetUpdStatus, &READY);
        bus.queue_response(UpdateOp::GetInfo2, &info2(true));
        bus.queue_response(UpdateOp::GetUid, &0xCAFE_BABEu32.to_le_bytes());
        bus.queue_response(UpdateOp::GetNonce, &[0x33; 32]);
        let dev = device(&bus);

        let reply = dev.call(UpdateCommand::StartUpdate).unwrap();
        assert_eq!(
            reply,
            UpdateReply::Started {
                nonce: [0x33; 32],
                battery_id: 0xCAFE_BABE,
            }
        );
        assert_eq!(ops(&bus), vec![0x02, 0x03, 0x06, 0x04, 0x05]);
        assert_eq!(dev.state(), UpdateState::AwaitingChallenge);
        assert_eq!(dev.properties().battery_id, Some(0xCAFE_BABE));
    }

    #[test]
    fn test_get_info_caches_two_stage_flag() {
        let bus = MockBus::new();
        bus.set_response(UpdateOp::GetUpdStatus, &READY);
        let mut info = vec![0u8; UPDATE_DATA_LEN];
        info[..4].copy_from_slice(&7u32.to_le_bytes());
        bus.queue_response(UpdateOp::GetInfo, &info);
        bus.queue_response(UpdateOp::GetInfo2, &info2(true));
        let dev = device(&bus);

        match dev.call(UpdateCommand::GetInfo).unwrap() {
            UpdateReply::Info(info) => {
                assert_eq!(info.info.fw_version, 7);
                assert_eq!(info.info2.hw_id, 0xBEEF);
                assert!(info.info2.is_two_stage());
            }
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(ops(&bus), vec![0x01, 0x02]);
        assert_eq!(dev.state(), UpdateState::Idle);

        bus.clear_log();
        dev.call(UpdateCommand::StartUpdate).unwrap();
        assert_eq!(ops(&bus)[0], 0x03);
    }

    #[test]
    fn test_certificate_transfer() {
        let bus = MockBus::new();
        bus.set_response(UpdateOp::GetUpdStatus, &READY);
        let observer = Arc::new(RecordingObserver::default());
        let dev = UpdateDevice::with_observer(
            Arc::new(bus.clone()),
            EngineConfig::fast(),
            observer.clone(),
        )
        .unwrap();
        start_session(&bus, &dev, false);

        let mut signature = [0x11u8; 64];
        signature[32..].fill(0x22);
        let artifact = Artifact::certificate(vec![0xAB; 40], signature);
        assert_eq!(
            dev.call(UpdateCommand::SendData(artifact)).unwrap(),
            UpdateReply::DataAccepted
        );

        assert_eq!(
            ops(&bus),
            vec![0x06, 0x10, 0x06, 0x11, 0x06, 0x11, 0x06, 0x12, 0x06, 0x13, 0x06]
        );
        let data = bus.writes_to(UPDATE_DATA_KEY);
        assert_eq!(data.len(), 5);
        assert!(data.iter().all(|w| w.len() == UPDATE_DATA_LEN));
        assert_eq!(&data[0][..2], &[40, 0]);
        assert_eq!(data[1], vec![0xAB; 32]);
        assert_eq!(&data[2][..8], &[0xAB; 8]);
        assert!(data[2][8..].iter().all(|&b| b == 0));
        assert_eq!(data[3], vec![0x11; 32]);
        assert_eq!(data[4], vec![0x22; 32]);
        assert_eq!(dev.state(), UpdateState::AwaitingChallenge);

        let progress: Vec<(u64, u64)> = observer
            .events()
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Progress { current, total, .. } => Some((*current, *total)),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![(1, 2), (2, 2)]);
    }

    #[test]
    fn test_single_stage_firmware_then_commit() {
        let bus = MockBus::new();
        // StartUpdate, pre-poll, StartImage and three chunks see Ready; the
        // block count write then reads the default Reset.
        for _ in 0..6 {
            bus.queue_response(UpdateOp::GetUpdStatus, &READY);
        }
        let dev = device(&bus);
        start_session(&bus, &dev, false);

        let image = Artifact::image(ImageKind::Firmware, (0..70).collect());
        dev.call(UpdateCommand::SendData(image)).unwrap();
        assert_eq!(
            ops(&bus),
            vec![0x06, 0x07, 0x06, 0x1A, 0x06, 0x1A, 0x06, 0x1A, 0x06, 0x1B, 0x06]
        );
        let data = bus.writes_to(UPDATE_DATA_KEY);
        assert_eq!(data[0][0], ImageSet::FIRMWARE.bits());
        assert_eq!(&data.last().unwrap()[..2], &[3, 0]);

        bus.clear_log();
        bus.set_response(UpdateOp::GetUpdStatus, &SUCCESS);
        assert_eq!(
            dev.call(UpdateCommand::CommitImage).unwrap(),
            UpdateReply::Committed
        );
        assert_eq!(ops(&bus), vec![0x1D, 0x06]);
        assert_eq!(dev.state(), UpdateState::Done);
    }

    #[test]
    fn test_two_stage_image_finishes_ready() {
        let bus = MockBus::new();
        bus.set_response(UpdateOp::GetUpdStatus, &READY);
        let dev = device(&bus);
        start_session(&bus, &dev, true);

        let image = Artifact::image(ImageKind::Dnvd, vec![5; 32]);
        dev.call(UpdateCommand::SendData(image)).unwrap();
        assert_eq!(bus.writes_to(UPDATE_DATA_KEY)[0][0], ImageSet::DNVD.bits());
        assert_eq!(dev.state(), UpdateState::AwaitingChallenge);
    }

    #[test]
    fn test_digest_dictionary_starts_crypto() {
        let bus = MockBus::new();
        bus.set_response(UpdateOp::GetUpdStatus, &READY);
        let dev = device(&bus);
        start_session(&bus, &dev, false);

        let images = ImageSet::FIRMWARE | ImageSet::CONFIGURATION;
        let dict = Artifact::digest_dictionary(vec![9; 10], images);
        dev.call(UpdateCommand::SendData(dict)).unwrap();
        assert_eq!(ops(&bus), vec![0x06, 0x18, 0x06, 0x19, 0x06, 0x1C, 0x06]);
        assert_eq!(bus.writes_to(UPDATE_DATA_KEY).last().unwrap()[0], 0b011);
    }

    #[test]
    fn test_start_crypto_without_images_is_rejected() {
        let bus = MockBus::new();
        bus.set_response(UpdateOp::GetUpdStatus, &READY);
        let dev = device(&bus);
        start_session(&bus, &dev, false);

        let dict = Artifact::digest_dictionary(vec![9; 10], ImageSet::empty());
        let err = dev.call(UpdateCommand::SendData(dict)).unwrap_err();
        assert!(matches!(err, Fault::BadArgument(_)));
        assert!(bus.get_writes().is_empty());
        assert_eq!(dev.state(), UpdateState::AwaitingChallenge);
    }

    #[test]
    fn test_session_required_for_data_and_commit() {
        let bus = MockBus::new();
        let dev = device(&bus);

        let artifact = Artifact::image(ImageKind::Config, vec![1; 4]);
        let err = dev.call(UpdateCommand::SendData(artifact)).unwrap_err();
        assert!(matches!(err, Fault::BadArgument(_)));
        let err = dev.call(UpdateCommand::CommitImage).unwrap_err();
        assert!(matches!(err, Fault::BadArgument(_)));
        assert!(bus.get_writes().is_empty());
        assert_eq!(dev.state(), UpdateState::Idle);
    }

    #[test]
    fn test_poll_exhaustion_fails_session() {
        let bus = MockBus::new();
        bus.set_response(UpdateOp::GetUpdStatus, &BUSY);
        bus.queue_response(UpdateOp::GetInfo2, &info2(false));
        let dev = device(&bus);

        let err = dev.call(UpdateCommand::StartUpdate).unwrap_err();
        assert!(matches!(err, Fault::Timeout(_)));
        let polls = ops(&bus).iter().filter(|&&op| op == 0x06).count();
        assert_eq!(polls, 12);
        assert_eq!(dev.state(), UpdateState::Failed(err));
    }

    #[test]
    fn test_poll_tolerates_status_fault() {
        let bus = MockBus::new();
        bus.set_response(UpdateOp::GetUpdStatus, &READY);
        bus.queue_status(UpdateOp::GetUpdStatus, 0x01, 0);
        bus.queue_response(UpdateOp::GetInfo2, &info2(false));
        let dev = device(&bus);

        dev.call(UpdateCommand::StartUpdate).unwrap();
        assert_eq!(ops(&bus), vec![0x02, 0x03, 0x06, 0x06, 0x04, 0x05]);
        assert_eq!(dev.properties().communication_error, Some(0x01));
    }

    #[test]
    fn test_invalid_pre_write_state_is_internal() {
        let bus = MockBus::new();
        bus.set_response(UpdateOp::GetUpdStatus, &READY);
        let dev = device(&bus);
        start_session(&bus, &dev, false);

        bus.set_response(UpdateOp::GetUpdStatus, &SUCCESS);
        let cert = Artifact::certificate(vec![1; 8], [0; 64]);
        let err = dev.call(UpdateCommand::SendData(cert.clone())).unwrap_err();
        assert!(matches!(err, Fault::Internal(_)));
        assert_eq!(ops(&bus), vec![0x06]);

        // Failed sessions must be restarted.
        let err = dev.call(UpdateCommand::SendData(cert)).unwrap_err();
        assert!(matches!(err, Fault::BadArgument(_)));
    }

    #[test]
    fn test_updater_error_status_reported() {
        let bus = MockBus::new();
        bus.queue_response(UpdateOp::GetInfo2, &info2(false));
        bus.queue_status(UpdateOp::StartUpdate, 0, 0x0007);
        let observer = Arc::new(RecordingObserver::default());
        let dev = UpdateDevice::with_observer(
            Arc::new(bus.clone()),
            EngineConfig::fast(),
            observer.clone(),
        )
        .unwrap();

        let err = dev.call(UpdateCommand::StartUpdate).unwrap_err();
        assert!(matches!(err, Fault::Protocol { .. }));
        assert_eq!(dev.properties().updater_status, Some(7));
        assert!(observer.events().iter().any(|e| matches!(
            e,
            EngineEvent::DiagnosticRaised {
                device: DeviceKind::Updater,
                diagnostic: Diagnostic::UpdaterStatus(7),
            }
        )));
    }

    #[test]
    fn test_requests_queue_in_order() {
        let bus = MockBus::new();
        let dev = device(&bus);
        let (tx, rx) = mpsc::channel();

        for _ in 0..3 {
            let tx = tx.clone();
            dev.submit(
                UpdateCommand::GetInfo,
                Box::new(move |outcome: Outcome| {
                    let _ = tx.send(outcome.result.is_ok());
                }),
            )
            .unwrap();
        }
        for _ in 0..3 {
            assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        }
        assert_eq!(ops(&bus), vec![0x01, 0x02, 0x01, 0x02, 0x01, 0x02]);
    }
}
