//! Scripted in-memory radio shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use trainerlink::{
    message::RF_EVENT,
    protocol::{Command, CONNECTION_SUCCESSFUL, NO_CONNECTION},
    FrameListener, ListenerRegistry, Message, MessageId, ResponseCode, Result, Transport,
};

type Script = dyn FnMut(&Message) -> Vec<Message> + Send;

/// Zero-padded 8-byte data packet
pub fn packet(prefix: &[u8]) -> [u8; 8] {
    let mut data = [0u8; 8];
    data[..prefix.len()].copy_from_slice(prefix);
    data
}

/// Distance report from the headunit
pub fn distance_packet(metres: u32) -> [u8; 8] {
    let d = metres.to_be_bytes();
    packet(&[0xDD, 0x02, d[0], d[1], d[2], d[3], 0])
}

/// Answers of the stick itself: startup after reset, `NO_ERROR` for every
/// command, a closed event after close, `EVENT_TX` for every data message.
pub fn radio(message: &Message) -> Vec<Message> {
    let channel = message.payload().first().copied().unwrap_or(0);
    match message.id() {
        MessageId::ResetSystem => vec![Message::new(MessageId::StartupMessage)],
        MessageId::CloseChannel => vec![
            Message::channel_event(channel, message.id() as u8, ResponseCode::NoError),
            Message::channel_event(channel, RF_EVENT, ResponseCode::ChannelClosed),
        ],
        id if id.is_data() => vec![Message::channel_event(channel, RF_EVENT, ResponseCode::Tx)],
        id => vec![Message::channel_event(channel, id as u8, ResponseCode::NoError)],
    }
}

/// Whether `message` is a data message starting with `prefix`
pub fn is_data_with(message: &Message, prefix: &[u8]) -> bool {
    message.data().is_ok_and(|data| data.starts_with(prefix))
}

/// A headunit that accepts INIT and DISCONNECT and reports zero distance
/// after every odometer reset
pub fn cooperative_headunit(message: &Message) -> Vec<Message> {
    let mut replies = radio(message);
    let channel = message.payload().first().copied().unwrap_or(0);
    let reply = |data: &[u8]| Message::broadcast(channel, &packet(data)).ok();
    if is_data_with(message, &Command::Init.packet()) {
        replies.extend(reply(&CONNECTION_SUCCESSFUL));
    } else if is_data_with(message, &Command::ResetOdometer.packet()) {
        replies.extend(reply(&distance_packet(0)));
    } else if is_data_with(message, &Command::Disconnect.packet()) {
        replies.extend(reply(&NO_CONNECTION));
    }
    replies
}

/// Transport double: every written frame is recorded and answered by the
/// script, with answers delivered to frame listeners before `send` returns.
pub struct MockTransport {
    script: Mutex<Box<Script>>,
    sent: Mutex<Vec<Message>>,
    listeners: ListenerRegistry<FrameListener>,
    running: AtomicBool,
}

impl MockTransport {
    pub fn new(script: impl FnMut(&Message) -> Vec<Message> + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(Box::new(script)),
            sent: Mutex::new(Vec::new()),
            listeners: ListenerRegistry::new(),
            running: AtomicBool::new(false),
        })
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    /// Number of data messages sent whose payload starts with `prefix`
    pub fn count(&self, prefix: &[u8]) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| is_data_with(m, prefix))
            .count()
    }

    /// Deliver an unsolicited message from the radio
    pub fn inject(&self, message: &Message) {
        let frame = message.encode();
        self.listeners.notify(|listener| listener(&frame));
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, frame: Bytes) -> Result<()> {
        let message = Message::decode(&frame)?;
        self.sent.lock().unwrap().push(message.clone());
        let replies = {
            let mut script = self.script.lock().unwrap();
            (script.as_mut())(&message)
        };
        for reply in &replies {
            self.inject(reply);
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn add_frame_listener(&self, listener: &Arc<FrameListener>) {
        self.listeners.register(listener);
    }

    fn remove_frame_listener(&self, listener: &Arc<FrameListener>) -> bool {
        self.listeners.unregister(listener)
    }
}
