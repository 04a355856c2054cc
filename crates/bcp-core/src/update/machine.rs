//! Gas gauge firmware update sequencing on the device worker.

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use super::artifact::{Artifact, ArtifactKind, ImageKind};
use super::command::{UpdateCommand, UpdateCommandId, UpdateReply};
use super::state::UpdateState;
use crate::config::{PollProfile, UpdateConfig};
use crate::dispatch::{CommandDispatcher, Completion, StatusPolicy};
use crate::engine::{Callback, CommandOutcome, deliver};
use crate::events::{DeviceKind, EngineEvent, EngineObserver};
use crate::fault::Fault;
use crate::properties::{PropertyCell, UpdaterProperties};
use crate::protocol::constants::{NONCE_LEN, SIGNATURE_LEN, UPDATE_DATA_LEN};
use crate::protocol::info::{read_u16_le, read_u32_le};
use crate::protocol::{GaugeInfo, GaugeInfo2, UpdateOp, UpdaterInfo, UpdaterStatus};

pub(crate) struct UpdateRequest {
    pub command: UpdateCommand,
    pub callback: Callback<UpdateCommandId, UpdateReply>,
}

/// Op codes used to transfer one artifact kind.
struct ArtifactOps {
    /// Byte length for plain artifacts, block count for images.
    length: UpdateOp,
    data: UpdateOp,
    signature: Option<(UpdateOp, UpdateOp)>,
}

impl ArtifactOps {
    fn for_kind(kind: ArtifactKind) -> Self {
        match kind {
            ArtifactKind::Certificate => Self {
                length: UpdateOp::SetCertLen,
                data: UpdateOp::SetCert,
                signature: Some((UpdateOp::SetCertSign1, UpdateOp::SetCertSign2)),
            },
            ArtifactKind::Manifest => Self {
                length: UpdateOp::SetImg4Len,
                data: UpdateOp::SetImg4,
                signature: Some((UpdateOp::SetImg4Sign1, UpdateOp::SetImg4Sign2)),
            },
            ArtifactKind::DigestDictionary => Self {
                length: UpdateOp::SetDigDictLen,
                data: UpdateOp::SetDigDict,
                signature: None,
            },
            ArtifactKind::Image(_) => Self {
                length: UpdateOp::SetDone,
                data: UpdateOp::SetImageData,
                signature: None,
            },
        }
    }
}

fn length_field(kind: ArtifactKind, len: usize) -> Result<[u8; 2], Fault> {
    u16::try_from(len)
        .map(u16::to_le_bytes)
        .map_err(|_| Fault::BadArgument(format!("{} length {} exceeds 16 bits", kind, len)))
}

pub(crate) struct UpdateMachine {
    dispatcher: CommandDispatcher<UpdateRequest>,
    config: UpdateConfig,
    properties: PropertyCell<UpdaterProperties>,
    state: PropertyCell<UpdateState>,
    observer: Arc<dyn EngineObserver>,
    /// Cached from GetInfo2.
    two_stage: Option<bool>,
}

impl UpdateMachine {
    pub(crate) fn new(
        dispatcher: CommandDispatcher<UpdateRequest>,
        config: UpdateConfig,
        properties: PropertyCell<UpdaterProperties>,
        state: PropertyCell<UpdateState>,
        observer: Arc<dyn EngineObserver>,
    ) -> Self {
        Self {
            dispatcher,
            config,
            properties,
            state,
            observer,
            two_stage: None,
        }
    }

    pub(crate) fn run(mut self) {
        while let Some(request) = self.dispatcher.next_request() {
            let id = request.command.id();
            let result = self.execute(request.command);

            self.observer.on_event(&EngineEvent::CommandCompleted {
                device: DeviceKind::Updater,
                command: id.to_string(),
                code: result.as_ref().err().map(Fault::code),
            });
            deliver(request.callback, CommandOutcome { command: id, result });
        }
        debug!("Update worker stopped");
    }

    fn goto_state(&mut self, new_state: UpdateState) {
        let from = self.state.update(|state| std::mem::replace(state, new_state.clone()));
        info!(from = %from, to = %new_state, "State transition");
        self.observer.on_event(&EngineEvent::StateChanged {
            from,
            to: new_state,
        });
    }

    /// Run a session step, landing in `done` or `Failed`.
    fn step<T>(
        &mut self,
        done: UpdateState,
        body: impl FnOnce(&mut Self) -> Result<T, Fault>,
    ) -> Result<T, Fault> {
        match body(self) {
            Ok(value) => {
                self.goto_state(done);
                Ok(value)
            }
            Err(fault) => {
                self.goto_state(UpdateState::Failed(fault.clone()));
                Err(fault)
            }
        }
    }

    fn require_session(&self, id: UpdateCommandId) -> Result<(), Fault> {
        let state = self.state.snapshot();
        if state.accepts_artifacts() {
            return Ok(());
        }
        warn!(command = %id, state = %state, "Command rejected in current state");
        Err(Fault::BadArgument(format!("{} not allowed in state {}", id, state)))
    }

    #[instrument(skip_all, fields(command = %command.id()))]
    fn execute(&mut self, command: UpdateCommand) -> Result<UpdateReply, Fault> {
        match command {
            UpdateCommand::GetInfo => self.get_info().map(UpdateReply::Info),
            UpdateCommand::StartUpdate => {
                self.goto_state(UpdateState::Initializing);
                self.step(UpdateState::AwaitingChallenge, Self::start_update)
            }
            UpdateCommand::SendData(artifact) => {
                self.require_session(UpdateCommandId::SendData)?;
                artifact.validate()?;
                self.step(UpdateState::AwaitingChallenge, |machine| {
                    machine.write_artifact(&artifact)
                })?;
                Ok(UpdateReply::DataAccepted)
            }
            UpdateCommand::CommitImage => {
                self.require_session(UpdateCommandId::CommitImage)?;
                self.goto_state(UpdateState::Committing);
                self.step(UpdateState::Done, |machine| {
                    let profile = machine.config.commit;
                    machine.handshake(UpdateOp::CommitImage, None, profile, UpdaterStatus::Success)
                })?;
                Ok(UpdateReply::Committed)
            }
        }
    }

    /// Command with an immediate data register response.
    fn query(&mut self, op: UpdateOp, len: usize) -> Result<Vec<u8>, Fault> {
        self.dispatcher.transact(
            op,
            None,
            self.config.completion_timeout(),
            StatusPolicy::Update,
        )?;
        self.dispatcher.read_response(op, len)
    }

    /// Command followed by a wait for the updater to settle in `expected`.
    fn handshake(
        &mut self,
        op: UpdateOp,
        payload: Option<&[u8]>,
        profile: PollProfile,
        expected: UpdaterStatus,
    ) -> Result<(), Fault> {
        self.dispatcher.transact(
            op,
            payload,
            self.config.completion_timeout(),
            StatusPolicy::Update,
        )?;
        self.dispatcher.pause(profile.typical());

        let status = self.poll_updater(profile)?;
        if status != expected {
            error!(op = %op, actual = %status, expected = %expected, "Unexpected updater status");
            return Err(Fault::Timeout(format!(
                "{}: updater {} (expected {})",
                op, status, expected
            )));
        }
        Ok(())
    }

    /// Poll until the updater is no longer busy or the profile runs out.
    fn poll_updater(&mut self, profile: PollProfile) -> Result<UpdaterStatus, Fault> {
        let max_retries = profile.max_retries();
        let mut status = UpdaterStatus::Busy;
        let mut retry = 0u64;

        loop {
            if retry > 0 {
                self.dispatcher.pause(profile.interval());
            }
            if let Some(polled) = self.read_updater_status()? {
                status = polled;
            }
            if status != UpdaterStatus::Busy || retry >= max_retries {
                break;
            }
            retry += 1;
        }

        debug!(status = %status, polls = retry + 1, "Updater status");
        Ok(status)
    }

    /// One status read. Missed notifications and status faults count as
    /// "still busy"; only bus failures abort.
    fn read_updater_status(&mut self) -> Result<Option<UpdaterStatus>, Fault> {
        let op = UpdateOp::GetUpdStatus;
        self.dispatcher.send_command(op, None)?;
        if self.dispatcher.await_completion(op, self.config.completion_timeout())
            == Completion::TimedOut
        {
            return Ok(None);
        }
        if let Err(fault) = self.dispatcher.check_status(op, StatusPolicy::Update) {
            debug!(error = %fault, "Status poll rejected, polling again");
            return Ok(None);
        }

        let buf = self.dispatcher.read_response(op, UPDATE_DATA_LEN)?;
        Ok(Some(UpdaterStatus::from_u16(read_u16_le(&buf)?)))
    }

    fn read_info2(&mut self) -> Result<GaugeInfo2, Fault> {
        let info2 = GaugeInfo2::from_bytes(&self.query(UpdateOp::GetInfo2, UPDATE_DATA_LEN)?)?;
        self.two_stage = Some(info2.is_two_stage());
        debug!(two_stage = info2.is_two_stage(), hw_id = %format!("0x{:08X}", info2.hw_id), "Updater capabilities");
        Ok(info2)
    }

    fn get_info(&mut self) -> Result<UpdaterInfo, Fault> {
        let info = GaugeInfo::from_bytes(&self.query(UpdateOp::GetInfo, UPDATE_DATA_LEN)?)?;
        let info2 = self.read_info2()?;
        Ok(UpdaterInfo { info, info2 })
    }

    fn start_update(&mut self) -> Result<UpdateReply, Fault> {
        self.properties.update(UpdaterProperties::clear_errors);

        if self.two_stage.is_none() {
            self.read_info2()?;
        }
        let profile = self.config.init;
        self.handshake(UpdateOp::StartUpdate, None, profile, UpdaterStatus::Ready)?;

        let battery_id = read_u32_le(&self.query(UpdateOp::GetUid, 4)?)?;
        self.properties.update(|props| props.battery_id = Some(battery_id));
        info!(battery_id = %format!("0x{:08X}", battery_id), "Update session started");

        let buf = self.query(UpdateOp::GetNonce, NONCE_LEN)?;
        let nonce = <[u8; NONCE_LEN]>::try_from(buf.as_slice())
            .map_err(|_| Fault::Io(format!("GetNonce returned {} bytes", buf.len())))?;

        Ok(UpdateReply::Started { nonce, battery_id })
    }

    fn write_artifact(&mut self, artifact: &Artifact) -> Result<(), Fault> {
        let kind = artifact.kind;
        let ops = ArtifactOps::for_kind(kind);
        self.goto_state(UpdateState::WritingArtifact(kind));
        info!(kind = %kind, len = artifact.data.len(), "Writing artifact");

        let status = self.poll_updater(self.config.pre_write)?;
        let ready = match kind {
            ArtifactKind::Image(_) => matches!(
                status,
                UpdaterStatus::Ready | UpdaterStatus::Success | UpdaterStatus::Reset
            ),
            _ => status == UpdaterStatus::Ready,
        };
        if !ready {
            error!(kind = %kind, status = %status, "Updater in invalid state");
            return Err(Fault::Internal(format!("updater in invalid state {}", status)));
        }

        match kind {
            ArtifactKind::Image(image) => {
                let profile = self.start_profile(image);
                let selector = [image.image_set().bits()];
                self.handshake(UpdateOp::StartImage, Some(&selector), profile, UpdaterStatus::Ready)?;
            }
            _ => {
                let length = length_field(kind, artifact.data.len())?;
                let profile = self.config.write_length;
                self.handshake(ops.length, Some(&length), profile, UpdaterStatus::Ready)?;
            }
        }

        self.write_chunks(artifact, ops.data)?;
        self.goto_state(UpdateState::PollingUpdater);

        match kind {
            ArtifactKind::Image(image) => {
                let blocks = length_field(kind, artifact.block_count())?;
                let (profile, expected) = self.finish_profile(image);
                self.handshake(ops.length, Some(&blocks), profile, expected)?;
            }
            ArtifactKind::DigestDictionary => {
                let images = [artifact.images.bits()];
                let profile = self.config.start_crypto;
                self.handshake(UpdateOp::StartCrypto, Some(&images), profile, UpdaterStatus::Ready)?;
            }
            ArtifactKind::Certificate | ArtifactKind::Manifest => {
                let signature = artifact
                    .signature
                    .ok_or_else(|| Fault::BadArgument(format!("{} requires a signature", kind)))?;
                if let Some(halves) = ops.signature {
                    self.write_signature(&signature, halves)?;
                }
            }
        }

        self.properties.update(UpdaterProperties::clear_errors);
        info!(kind = %kind, "Artifact accepted");
        Ok(())
    }

    fn write_chunks(&mut self, artifact: &Artifact, op: UpdateOp) -> Result<(), Fault> {
        let mut chunks = artifact.chunks();
        let total = chunks.total() as u64;
        let profile = self.config.data_chunk;
        let operation = artifact.kind.to_string();

        while let Some(chunk) = chunks.next() {
            self.handshake(op, Some(&chunk), profile, UpdaterStatus::Ready)
                .inspect_err(|fault| {
                    error!(op = %op, offset = chunks.offset(), error = %fault, "Chunk rejected");
                })?;
            self.observer.on_event(&EngineEvent::Progress {
                operation: operation.clone(),
                current: chunks.current() as u64,
                total,
            });
        }
        Ok(())
    }

    fn write_signature(
        &mut self,
        signature: &[u8; SIGNATURE_LEN],
        (first, second): (UpdateOp, UpdateOp),
    ) -> Result<(), Fault> {
        let profile = self.config.signature;
        let (head, tail) = signature.split_at(SIGNATURE_LEN / 2);
        self.handshake(first, Some(head), profile, UpdaterStatus::Ready)?;
        self.handshake(second, Some(tail), profile, UpdaterStatus::Ready)
    }

    fn start_profile(&self, image: ImageKind) -> PollProfile {
        match image {
            ImageKind::Firmware => self.config.start_firmware,
            ImageKind::Config | ImageKind::Dnvd => self.config.start_image,
        }
    }

    /// Timing and terminal status of the block-count write that closes an image.
    fn finish_profile(&self, image: ImageKind) -> (PollProfile, UpdaterStatus) {
        let two_stage = self.two_stage.unwrap_or(false);
        let (profile, single_stage) = match image {
            ImageKind::Dnvd => (self.config.finish_dnvd, UpdaterStatus::Success),
            ImageKind::Config => (self.config.finish_config, UpdaterStatus::Reset),
            ImageKind::Firmware => (self.config.finish_firmware, UpdaterStatus::Reset),
        };
        if two_stage {
            (profile, UpdaterStatus::Ready)
        } else {
            (profile, single_stage)
        }
    }
}
