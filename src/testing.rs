//! In-memory transport for unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use crate::{
    error::Result,
    message::{Message, MessageId, ResponseCode},
    messenger::ListenerRegistry,
    usb::{FrameListener, Transport},
};

type Responder = dyn Fn(&Message) -> Vec<Message> + Send + Sync;

/// What an ANT stick answers to configuration commands: a startup message
/// after reset, `RESPONSE_NO_ERROR` for every command, and a closed event
/// after close. Data messages get no answer.
pub(crate) fn radio_responses(message: &Message) -> Vec<Message> {
    let channel = message.payload()[0];
    match message.id() {
        MessageId::ResetSystem => vec![Message::new(MessageId::StartupMessage)],
        MessageId::CloseChannel => vec![
            Message::channel_event(channel, message.id() as u8, ResponseCode::NoError),
            Message::channel_event(channel, crate::message::RF_EVENT, ResponseCode::ChannelClosed),
        ],
        id if !id.is_data() => vec![Message::channel_event(
            channel,
            id as u8,
            ResponseCode::NoError,
        )],
        _ => Vec::new(),
    }
}

/// Transport double that answers each written frame from a responder
/// function, delivering the answers synchronously to frame listeners.
pub(crate) struct ScriptedTransport {
    responder: Box<Responder>,
    sent: Mutex<Vec<Message>>,
    listeners: ListenerRegistry<FrameListener>,
    running: AtomicBool,
}

impl ScriptedTransport {
    pub(crate) fn new(
        responder: impl Fn(&Message) -> Vec<Message> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            sent: Mutex::new(Vec::new()),
            listeners: ListenerRegistry::new(),
            running: AtomicBool::new(false),
        })
    }

    pub(crate) fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    /// Count sent data messages whose payload starts with `prefix`
    pub(crate) fn sent_with_prefix(&self, prefix: &[u8]) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.data().is_ok_and(|d| d.starts_with(prefix)))
            .count()
    }

    /// Deliver an unsolicited inbound message
    pub(crate) fn inject(&self, message: &Message) {
        let frame = message.encode();
        self.listeners.notify(|listener| listener(&frame));
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
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
        let responses = (self.responder)(&message);
        for response in &responses {
            self.inject(response);
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
