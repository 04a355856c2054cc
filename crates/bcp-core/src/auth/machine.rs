//! Authentication protocol sequencing on the device worker.

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use super::command::{AuthCommand, AuthCommandId, AuthReply};
use super::trust::TrustRecord;
use crate::config::{AuthConfig, ChipVariant};
use crate::dispatch::{CommandDispatcher, StatusPolicy};
use crate::engine::{Callback, CommandOutcome, deliver};
use crate::events::{DeviceKind, EngineEvent, EngineObserver};
use crate::fault::Fault;
use crate::gate::BusyGate;
use crate::metrics::{Metrics, RetryChannel};
use crate::properties::{AuthProperties, PropertyCell};
use crate::protocol::constants::{
    AUTH_DATA_LEN, AUTH_STATUS_LEN, CERT_SERIAL_LEN, GAUGE_CONTROL_KEY, GAUGE_READBACK_KEY,
    GAUGE_RESET_COUNT_CMD, MAX_CERT_LEN, NONCE_LEN, SIGNATURE_LEN, VERIDIAN_STATUS_OK,
    veridian_status_name,
};
use crate::protocol::info::read_u16_le;
use crate::protocol::{AuthInfo, AuthOp, Opcode};

pub(crate) struct AuthRequest {
    pub command: AuthCommand,
    pub callback: Callback<AuthCommandId, AuthReply>,
}

fn take_array<const N: usize>(op: AuthOp, buf: &[u8]) -> Result<[u8; N], Fault> {
    buf.get(..N)
        .and_then(|head| <[u8; N]>::try_from(head).ok())
        .ok_or_else(|| Fault::Io(format!("{} returned {} bytes, expected {}", op, buf.len(), N)))
}

/// Chunk faults that restart the certificate read from the first chunk.
fn restarts_certificate(fault: &Fault) -> bool {
    matches!(
        fault,
        Fault::Io(_) | Fault::Protocol { .. } | Fault::Timeout(_)
    )
}

pub(crate) struct AuthMachine {
    dispatcher: CommandDispatcher<AuthRequest>,
    config: AuthConfig,
    metrics: Arc<Metrics>,
    properties: PropertyCell<AuthProperties>,
    observer: Arc<dyn EngineObserver>,
    gate: Arc<BusyGate>,
    trust: TrustRecord,
}

impl AuthMachine {
    pub(crate) fn new(
        dispatcher: CommandDispatcher<AuthRequest>,
        config: AuthConfig,
        metrics: Arc<Metrics>,
        properties: PropertyCell<AuthProperties>,
        observer: Arc<dyn EngineObserver>,
        gate: Arc<BusyGate>,
    ) -> Self {
        let trust = TrustRecord::new(config.trusted_data_enabled);
        Self {
            dispatcher,
            config,
            metrics,
            properties,
            observer,
            gate,
            trust,
        }
    }

    /// Worker loop: one request at a time until shutdown.
    pub(crate) fn run(mut self) {
        while let Some(request) = self.dispatcher.next_request() {
            let id = request.command.id();
            let result = self.execute(request.command);

            self.observer.on_event(&EngineEvent::CommandCompleted {
                device: DeviceKind::Auth,
                command: id.to_string(),
                code: result.as_ref().err().map(Fault::code),
            });
            deliver(request.callback, CommandOutcome { command: id, result });
            self.gate.release();
        }
        debug!("Auth worker stopped");
    }

    #[instrument(skip_all, fields(command = %command.id()))]
    fn execute(&mut self, command: AuthCommand) -> Result<AuthReply, Fault> {
        match command {
            AuthCommand::GetInfo => {
                let buf = self.run_op(AuthOp::GetInfo, None, AUTH_DATA_LEN)?;
                let info = AuthInfo::from_bytes(self.config.chip, &buf)?;
                Ok(AuthReply::Info(info))
            }
            AuthCommand::GetCertificateSerial => {
                let buf = self.run_op(AuthOp::GetCertSerial, None, CERT_SERIAL_LEN)?;
                Ok(AuthReply::CertificateSerial(take_array(AuthOp::GetCertSerial, &buf)?))
            }
            AuthCommand::GetCertificate => self.get_certificate().map(AuthReply::Certificate),
            AuthCommand::GetSignature { challenge } => self.exchange_signature(&challenge),
            AuthCommand::SetTrustStatus { verdict } => self.set_trust_status(verdict),
        }
    }

    /// One command-register round trip, retried on bus faults.
    ///
    /// Returns the first `read_len` bytes of the data register, or nothing
    /// for operations that only write.
    fn run_op(
        &mut self,
        op: AuthOp,
        payload: Option<&[u8]>,
        read_len: usize,
    ) -> Result<Vec<u8>, Fault> {
        let resets_before = self.sample_controller_resets(op.channel());
        let attempts = self.config.command_attempts.max(1);
        let mut retried = false;
        let mut attempt = 0u32;

        let result = loop {
            attempt += 1;
            match self.attempt_op(op, payload, read_len) {
                Ok(buf) => break Ok(buf),
                Err(fault) if fault.is_bus() && attempt < attempts => {
                    warn!(op = %op, attempt = attempt, error = %fault, "Command failed, retrying");
                    retried = true;
                    self.note_command_retry(op, attempt);
                    self.dispatcher.pause(self.config.command_retry_delay());
                }
                Err(fault) => break Err(fault),
            }
        };

        if retried {
            self.account_controller_resets(resets_before, op.channel());
        }
        result
    }

    fn attempt_op(
        &mut self,
        op: AuthOp,
        payload: Option<&[u8]>,
        read_len: usize,
    ) -> Result<Vec<u8>, Fault> {
        self.dispatcher.transact(
            op,
            payload,
            self.config.completion_timeout(),
            StatusPolicy::Auth,
        )?;

        if op == AuthOp::SetChallenge {
            self.dispatcher.pause(self.config.challenge_settle());
        }
        if op.writes_data() {
            return Ok(Vec::new());
        }

        let mut buf = self.dispatcher.read_response(op, AUTH_DATA_LEN)?;
        buf.truncate(read_len);
        Ok(buf)
    }

    fn note_command_retry(&self, op: AuthOp, attempt: u32) {
        self.metrics.record_command_retry(op.channel());
        self.observer.on_event(&EngineEvent::CommandRetry {
            op: op.to_string(),
            attempt,
        });
    }

    /// Current gauge reset counter; reads as zero when unavailable.
    fn sample_controller_resets(&self, channel: RetryChannel) -> Option<u16> {
        if !self.config.chip.tracks_controller_resets() {
            return None;
        }
        let sample = self
            .dispatcher
            .write_register(
                GAUGE_CONTROL_KEY,
                &GAUGE_RESET_COUNT_CMD.to_le_bytes(),
                channel,
            )
            .and_then(|_| self.dispatcher.read_register(GAUGE_READBACK_KEY, 2, channel))
            .and_then(|buf| read_u16_le(&buf).map_err(Fault::from));

        match sample {
            Ok(count) => Some(count),
            Err(err) => {
                debug!(error = %err, "Reset counter unavailable");
                Some(0)
            }
        }
    }

    fn account_controller_resets(&self, before: Option<u16>, channel: RetryChannel) {
        let Some(before) = before else {
            return;
        };
        let Some(after) = self.sample_controller_resets(channel) else {
            return;
        };
        let delta = u64::from(after.wrapping_sub(before));
        if delta > 0 {
            warn!(delta = delta, "Gauge controller reset while retrying");
            self.metrics.record_controller_resets(delta);
            self.observer
                .on_event(&EngineEvent::ControllerResets { delta });
        }
    }

    fn get_certificate(&mut self) -> Result<Vec<u8>, Fault> {
        let buf = self.run_op(AuthOp::GetCertLength, None, 2)?;
        let cert_len = usize::from(read_u16_le(&buf)?);
        if cert_len > MAX_CERT_LEN {
            error!(length = cert_len, max = MAX_CERT_LEN, "Invalid certificate length");
            return Err(Fault::Internal(format!(
                "certificate length {} exceeds {}",
                cert_len, MAX_CERT_LEN
            )));
        }

        let channel = RetryChannel::Certificate;
        let resets_before = self.sample_controller_resets(channel);
        let attempts = self.config.command_attempts.max(1);
        let mut retried = false;
        let mut attempt = 0u32;

        let result = loop {
            attempt += 1;
            match self.read_certificate_chunks(cert_len) {
                Ok(cert) => break Ok(cert),
                Err(fault) if attempt < attempts && restarts_certificate(&fault) => {
                    warn!(attempt = attempt, error = %fault, "Certificate read failed, restarting");
                    retried = true;
                    self.note_command_retry(AuthOp::GetCert(0), attempt);
                    self.dispatcher.pause(self.config.command_retry_delay());
                }
                Err(fault) => break Err(fault),
            }
        };

        if retried {
            self.account_controller_resets(resets_before, channel);
        }
        result
    }

    fn read_certificate_chunks(&mut self, cert_len: usize) -> Result<Vec<u8>, Fault> {
        let mut cert = Vec::new();
        cert.try_reserve_exact(cert_len).map_err(|_| Fault::NoMemory)?;
        let mut index = 0u8;

        while cert.len() < cert_len {
            let op = AuthOp::cert_chunk(index).ok_or_else(|| {
                Fault::Internal(format!("certificate of {} bytes needs more chunks", cert_len))
            })?;
            self.dispatcher.transact(
                op,
                None,
                self.config.completion_timeout(),
                StatusPolicy::Auth,
            )?;
            let chunk = self.dispatcher.read_response(op, AUTH_DATA_LEN)?;
            let take = (cert_len - cert.len()).min(chunk.len());
            if take == 0 {
                return Err(Fault::Io(format!("{} returned no data", op)));
            }
            cert.extend_from_slice(&chunk[..take]);
            index += 1;
        }

        debug!(length = cert.len(), chunks = index, "Certificate read");
        Ok(cert)
    }

    fn exchange_signature(&mut self, challenge: &[u8]) -> Result<AuthReply, Fault> {
        self.run_op(AuthOp::SetChallenge, Some(challenge), 0)?;

        let nonce = match self.config.chip {
            ChipVariant::Veridian => {
                self.poll_signing_status()?;
                let buf = self.run_op(AuthOp::GetNonce, None, NONCE_LEN)?;
                Some(take_array::<NONCE_LEN>(AuthOp::GetNonce, &buf)?)
            }
            ChipVariant::Roswell => None,
        };

        let buf = self.run_op(AuthOp::GetSignature, None, SIGNATURE_LEN)?;
        let signature = take_array::<SIGNATURE_LEN>(AuthOp::GetSignature, &buf)?;

        if let Some(nonce) = nonce {
            self.trust.stage(nonce);
            if self.config.force_trust {
                info!("Trust forced by configuration");
                self.publish(true);
            }
        }

        Ok(AuthReply::Signature { signature, nonce })
    }

    /// Wait for the Veridian coprocessor to finish signing.
    fn poll_signing_status(&mut self) -> Result<(), Fault> {
        let iterations = self.config.status_poll_iterations();
        for iteration in 0..iterations {
            self.dispatcher.pause(self.config.status_poll_interval());
            let buf = self.run_op(AuthOp::GetStatus, None, AUTH_STATUS_LEN)?;
            let status = read_u16_le(&buf)?;
            debug!(
                iteration = iteration,
                status = %format!("0x{:04X}", status),
                name = veridian_status_name(status),
                "Signing status"
            );
            if status == VERIDIAN_STATUS_OK {
                return Ok(());
            }
        }
        Err(Fault::Timeout(format!(
            "signing status not ready after {} polls",
            iterations
        )))
    }

    fn set_trust_status(&mut self, verdict: u8) -> Result<AuthReply, Fault> {
        if !self.config.force_trust {
            self.publish(verdict != 0);
        }
        self.run_op(AuthOp::SetAuthStatus, Some(&[verdict]), 0)?;
        Ok(AuthReply::TrustStatusSet)
    }

    fn publish(&mut self, passed: bool) {
        let now = chrono::Utc::now().timestamp();
        let Some(publication) = self.trust.publish(passed, now) else {
            return;
        };
        self.properties.update(|props| publication.apply(props));
        self.observer.on_event(&EngineEvent::TrustPublished {
            passed: publication.passed,
            timestamp: publication.timestamp,
        });
    }
}
