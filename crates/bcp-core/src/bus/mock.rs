//! Scripted register bus for testing the protocol engines.
//!
//! A write to a command register immediately fires a notification for the
//! written op (status zero unless scripted). Reads of the matching data
//! register return whatever was scripted for the last op written.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::traits::{
    BusError, NotificationChannel, NotificationHandler, NotificationStatus, RegisterBus, SmcKey,
};
use crate::protocol::Opcode;
use crate::protocol::constants::{
    AUTH_COMMAND_KEY, AUTH_DATA_KEY, UPDATE_COMMAND_KEY, UPDATE_DATA_KEY,
};

type OpKey = (NotificationChannel, u8);
type SharedHandler = Arc<dyn Fn(NotificationStatus) + Send + Sync>;

#[derive(Default)]
struct MockState {
    handlers: HashMap<NotificationChannel, SharedHandler>,
    last_op: HashMap<NotificationChannel, u8>,
    /// One-shot data register responses per op.
    responses: HashMap<OpKey, VecDeque<Vec<u8>>>,
    /// Fallback data register response per op.
    sticky: HashMap<OpKey, Vec<u8>>,
    /// One-shot notification overrides per op.
    notifications: HashMap<OpKey, VecDeque<NotificationStatus>>,
    silenced: HashSet<OpKey>,
    /// Plain registers outside the command/data pairs.
    registers: HashMap<SmcKey, Vec<u8>>,
    queued_registers: HashMap<SmcKey, VecDeque<Vec<u8>>>,
    write_faults: HashMap<SmcKey, VecDeque<BusError>>,
    read_faults: HashMap<SmcKey, VecDeque<BusError>>,
    write_log: Vec<(SmcKey, Vec<u8>)>,
    read_log: Vec<(SmcKey, usize)>,
}

/// Mock bus for unit testing the protocol state machines.
#[derive(Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<MockState>>,
}

fn command_channel(key: SmcKey) -> Option<NotificationChannel> {
    if key == AUTH_COMMAND_KEY {
        Some(NotificationChannel::BatteryAuth)
    } else if key == UPDATE_COMMAND_KEY {
        Some(NotificationChannel::GasGaugeUpdate)
    } else {
        None
    }
}

fn data_channel(key: SmcKey) -> Option<NotificationChannel> {
    if key == AUTH_DATA_KEY {
        Some(NotificationChannel::BatteryAuth)
    } else if key == UPDATE_DATA_KEY {
        Some(NotificationChannel::GasGaugeUpdate)
    } else {
        None
    }
}

fn sized(mut data: Vec<u8>, len: usize) -> Vec<u8> {
    data.resize(len, 0);
    data
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a data register response returned once after `op`.
    pub fn queue_response<O: Opcode>(&self, op: O, data: &[u8]) {
        self.state()
            .responses
            .entry((O::CHANNEL, op.code()))
            .or_default()
            .push_back(data.to_vec());
    }

    /// Data register response returned after `op` whenever nothing is queued.
    pub fn set_response<O: Opcode>(&self, op: O, data: &[u8]) {
        self.state()
            .sticky
            .insert((O::CHANNEL, op.code()), data.to_vec());
    }

    /// Override the next notification fired for `op`.
    pub fn queue_notification<O: Opcode>(&self, op: O, status: NotificationStatus) {
        self.state()
            .notifications
            .entry((O::CHANNEL, op.code()))
            .or_default()
            .push_back(status);
    }

    /// Next notification for `op` reports the given statuses.
    pub fn queue_status<O: Opcode>(&self, op: O, bus_status: u8, chip_status: u16) {
        self.queue_notification(op, NotificationStatus::new(op.code(), bus_status, chip_status));
    }

    /// Never fire a notification for `op`.
    pub fn silence<O: Opcode>(&self, op: O) {
        self.state().silenced.insert((O::CHANNEL, op.code()));
    }

    pub fn set_register(&self, key: SmcKey, data: &[u8]) {
        self.state().registers.insert(key, data.to_vec());
    }

    /// Register value returned by the next read of `key` only.
    pub fn queue_register(&self, key: SmcKey, data: &[u8]) {
        self.state()
            .queued_registers
            .entry(key)
            .or_default()
            .push_back(data.to_vec());
    }

    /// Fail the next writes to `key` with the given errors, in order.
    pub fn fail_writes(&self, key: SmcKey, errors: impl IntoIterator<Item = BusError>) {
        self.state()
            .write_faults
            .entry(key)
            .or_default()
            .extend(errors);
    }

    /// Fail the next reads of `key` with the given errors, in order.
    pub fn fail_reads(&self, key: SmcKey, errors: impl IntoIterator<Item = BusError>) {
        self.state()
            .read_faults
            .entry(key)
            .or_default()
            .extend(errors);
    }

    /// Deliver a notification as if the controller raised it.
    pub fn notify(&self, channel: NotificationChannel, status: NotificationStatus) {
        let handler = self.state().handlers.get(&channel).cloned();
        if let Some(handler) = handler {
            handler(status);
        }
    }

    pub fn has_handler(&self, channel: NotificationChannel) -> bool {
        self.state().handlers.contains_key(&channel)
    }

    /// All successful writes, in order.
    pub fn get_writes(&self) -> Vec<(SmcKey, Vec<u8>)> {
        self.state().write_log.clone()
    }

    /// Successful writes to one key, in order.
    pub fn writes_to(&self, key: SmcKey) -> Vec<Vec<u8>> {
        self.state()
            .write_log
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Op codes written to the command register of `channel`.
    pub fn commands(&self, channel: NotificationChannel) -> Vec<u8> {
        self.state()
            .write_log
            .iter()
            .filter(|(k, _)| command_channel(*k) == Some(channel))
            .filter_map(|(_, data)| data.first().copied())
            .collect()
    }

    /// Successful reads, in order.
    pub fn get_reads(&self) -> Vec<(SmcKey, usize)> {
        self.state().read_log.clone()
    }

    pub fn clear_log(&self) {
        let mut state = self.state();
        state.write_log.clear();
        state.read_log.clear();
    }
}

impl RegisterBus for MockBus {
    fn write_register(&self, key: SmcKey, data: &[u8]) -> Result<(), BusError> {
        let fire = {
            let mut guard = self.state();
            let state = &mut *guard;
            if let Some(err) = state.write_faults.get_mut(&key).and_then(VecDeque::pop_front) {
                return Err(err);
            }
            state.write_log.push((key, data.to_vec()));

            match (command_channel(key), data.first()) {
                (Some(channel), Some(&op)) => {
                    state.last_op.insert(channel, op);
                    if state.silenced.contains(&(channel, op)) {
                        None
                    } else {
                        let status = state
                            .notifications
                            .get_mut(&(channel, op))
                            .and_then(VecDeque::pop_front)
                            .unwrap_or_else(|| NotificationStatus::new(op, 0, 0));
                        state
                            .handlers
                            .get(&channel)
                            .cloned()
                            .map(|handler| (handler, status))
                    }
                }
                _ => None,
            }
        };

        if let Some((handler, status)) = fire {
            handler(status);
        }
        Ok(())
    }

    fn read_register(&self, key: SmcKey, len: usize) -> Result<Vec<u8>, BusError> {
        let mut guard = self.state();
        let state = &mut *guard;
        if let Some(err) = state.read_faults.get_mut(&key).and_then(VecDeque::pop_front) {
            return Err(err);
        }

        let data = if let Some(channel) = data_channel(key) {
            let op = state.last_op.get(&channel).copied().unwrap_or(0);
            state
                .responses
                .get_mut(&(channel, op))
                .and_then(VecDeque::pop_front)
                .or_else(|| state.sticky.get(&(channel, op)).cloned())
                .unwrap_or_default()
        } else if let Some(queued) = state
            .queued_registers
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            queued
        } else {
            state
                .registers
                .get(&key)
                .cloned()
                .ok_or(BusError::KeyNotFound(key))?
        };

        state.read_log.push((key, len));
        Ok(sized(data, len))
    }

    fn register_notification_handler(
        &self,
        channel: NotificationChannel,
        handler: NotificationHandler,
    ) -> Result<(), BusError> {
        self.state().handlers.insert(channel, Arc::from(handler));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AuthOp, UpdateOp};
    use std::sync::mpsc;

    #[test]
    fn test_mock_command_fires_notification() {
        let mock = MockBus::new();
        let (tx, rx) = mpsc::channel();
        mock.register_notification_handler(
            NotificationChannel::BatteryAuth,
            Box::new(move |status: NotificationStatus| {
                let _ = tx.send(status);
            }),
        )
        .unwrap();

        mock.queue_status(AuthOp::GetInfo, 0, 7);
        mock.write_register(AUTH_COMMAND_KEY, &[AuthOp::GetInfo.code()]).unwrap();
        mock.write_register(AUTH_COMMAND_KEY, &[AuthOp::GetInfo.code()]).unwrap();

        assert_eq!(rx.try_recv().unwrap(), NotificationStatus::new(0x01, 0, 7));
        assert_eq!(rx.try_recv().unwrap(), NotificationStatus::new(0x01, 0, 0));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_mock_silenced_op() {
        let mock = MockBus::new();
        let (tx, rx) = mpsc::channel();
        mock.register_notification_handler(
            NotificationChannel::GasGaugeUpdate,
            Box::new(move |status: NotificationStatus| {
                let _ = tx.send(status);
            }),
        )
        .unwrap();

        mock.silence(UpdateOp::GetUpdStatus);
        mock.write_register(UPDATE_COMMAND_KEY, &[UpdateOp::GetUpdStatus.code()]).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(mock.commands(NotificationChannel::GasGaugeUpdate), vec![0x06]);
    }

    #[test]
    fn test_mock_responses_follow_last_op() {
        let mock = MockBus::new();
        mock.set_response(AuthOp::GetCertSerial, &[0xAA; 32]);
        mock.queue_response(AuthOp::GetCertSerial, &[0x55; 4]);

        mock.write_register(AUTH_COMMAND_KEY, &[AuthOp::GetCertSerial.code()]).unwrap();
        let first = mock.read_register(AUTH_DATA_KEY, 64).unwrap();
        assert_eq!(&first[..4], &[0x55; 4]);
        assert_eq!(&first[4..], &[0u8; 60][..]);

        let second = mock.read_register(AUTH_DATA_KEY, 32).unwrap();
        assert_eq!(second, vec![0xAA; 32]);

        mock.write_register(AUTH_COMMAND_KEY, &[AuthOp::GetInfo.code()]).unwrap();
        assert_eq!(mock.read_register(AUTH_DATA_KEY, 8).unwrap(), vec![0; 8]);
    }

    #[test]
    fn test_mock_fault_injection() {
        let mock = MockBus::new();
        mock.fail_writes(AUTH_DATA_KEY, [BusError::Busy, BusError::Timeout]);

        assert_eq!(mock.write_register(AUTH_DATA_KEY, &[1]), Err(BusError::Busy));
        assert_eq!(mock.write_register(AUTH_DATA_KEY, &[1]), Err(BusError::Timeout));
        assert!(mock.write_register(AUTH_DATA_KEY, &[1]).is_ok());
        assert_eq!(mock.writes_to(AUTH_DATA_KEY).len(), 1);
    }

    #[test]
    fn test_mock_plain_registers() {
        let key = SmcKey::new(b"GCRW");
        let mock = MockBus::new();
        assert_eq!(mock.read_register(key, 2), Err(BusError::KeyNotFound(key)));

        mock.set_register(key, &[3, 0]);
        mock.queue_register(key, &[9, 0]);
        assert_eq!(mock.read_register(key, 2).unwrap(), vec![9, 0]);
        assert_eq!(mock.read_register(key, 2).unwrap(), vec![3, 0]);
    }
}
