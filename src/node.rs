use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    sync::mpsc,
    time::{timeout_at, Instant},
};
use tracing::{debug, info, trace, warn};

use crate::{
    channel::{response_to, Channel, MessageCondition},
    error::{Result, TrainerError},
    message::{Field, Message, MessageId, ResponseCode},
    messenger::{BroadcastMessenger, EventListener},
    types::{NetworkKey, NodeConfig},
    usb::{FrameListener, Transport},
};

/// State shared between a [`Node`] and the channels it hands out
pub(crate) struct NodeShared {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) config: NodeConfig,
    pub(crate) messages: Arc<BroadcastMessenger<Message>>,
    allocated: Mutex<Vec<bool>>,
}

impl NodeShared {
    pub(crate) fn release(&self, number: u8) {
        let mut allocated = self.allocated.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = allocated.get_mut(usize::from(number)) {
            *slot = false;
        }
        debug!("Channel {} returned to pool", number);
    }

    pub(crate) fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.config.response_timeout_ms)
    }
}

/// Send `message` and wait until a message delivered through `messages`
/// satisfies `condition`, or `timeout` elapses.
///
/// The listener is registered before the frame is written so a reply that
/// arrives during the write is not missed.
pub(crate) async fn exchange(
    transport: &dyn Transport,
    messages: &BroadcastMessenger<Message>,
    message: &Message,
    condition: &mut dyn MessageCondition,
    timeout: Duration,
) -> Result<Message> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener: Arc<EventListener<Message>> = Arc::new(move |received: &Message| {
        let _ = tx.send(received.clone());
    });
    messages.add_listener(&listener);
    condition.reset();

    let deadline = Instant::now() + timeout;
    let result = async {
        transport.send(message.encode()).await?;
        trace!("Sent {}, waiting up to {:?}", message, timeout);
        loop {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(received)) => {
                    if condition.test(&received) {
                        return Ok(received);
                    }
                }
                Ok(None) => {
                    return Err(TrainerError::TransportUnavailable(
                        "message stream closed".to_string(),
                    ))
                }
                Err(_) => {
                    return Err(TrainerError::AckTimeout {
                        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    })
                }
            }
        }
    }
    .await;

    messages.remove_listener(&listener);
    result
}

/// Turn a channel response into an error unless it reports success
pub(crate) fn check_response(response: &Message, id: MessageId) -> Result<()> {
    match response.response_code()? {
        ResponseCode::NoError => Ok(()),
        code => Err(TrainerError::ResponseError {
            id: id as u8,
            code: code.into(),
        }),
    }
}

/// Local ANT radio: owns the channel pool and the network keys
///
/// Inbound frames from the transport are decoded here; malformed frames are
/// logged and dropped, everything else is republished to the node's message
/// listeners and, for channel-scoped messages, to the owning [`Channel`].
pub struct Node {
    shared: Arc<NodeShared>,
    frame_listener: Arc<FrameListener>,
    keys: Mutex<HashMap<u8, NetworkKey>>,
    started: tokio::sync::Mutex<bool>,
}

impl Node {
    /// Create a node over `transport`. Must be called within a Tokio runtime.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: NodeConfig) -> Self {
        let messages = Arc::new(BroadcastMessenger::new("node"));
        let publisher = messages.clone();
        let frame_listener: Arc<FrameListener> =
            Arc::new(move |frame: &[u8]| match Message::decode(frame) {
                Ok(message) => {
                    trace!("Received {}", message);
                    publisher.publish(message);
                }
                Err(e) => warn!("Dropping frame {:02X?}: {}", frame, e),
            });

        let allocated = vec![false; usize::from(config.max_channels)];
        Self {
            shared: Arc::new(NodeShared {
                transport,
                config,
                messages,
                allocated: Mutex::new(allocated),
            }),
            frame_listener,
            keys: Mutex::new(HashMap::new()),
            started: tokio::sync::Mutex::new(false),
        }
    }

    /// Start the transport and reset the radio. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates transport start/send failures.
    pub async fn start(&self) -> Result<()> {
        let mut started = self.started.lock().await;
        if *started {
            return Ok(());
        }

        self.shared.transport.start().await?;
        self.shared
            .transport
            .add_frame_listener(&self.frame_listener);

        let mut startup = |message: &Message| message.id() == MessageId::StartupMessage;
        match exchange(
            self.shared.transport.as_ref(),
            &self.shared.messages,
            &Message::reset_system(),
            &mut startup,
            self.shared.response_timeout(),
        )
        .await
        {
            Ok(_) => debug!("Radio reset complete"),
            Err(TrainerError::AckTimeout { .. }) => {
                warn!("No startup message after reset; continuing");
            }
            Err(e) => return Err(e),
        }

        *started = true;
        info!(
            "ANT node started with {} channel(s)",
            self.shared.config.max_channels
        );
        Ok(())
    }

    /// Detach from the transport and stop it. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates transport stop failures.
    pub async fn stop(&self) -> Result<()> {
        let mut started = self.started.lock().await;
        if !*started {
            return Ok(());
        }
        self.shared
            .transport
            .remove_frame_listener(&self.frame_listener);
        self.shared.transport.stop().await?;
        *started = false;
        info!("ANT node stopped");
        Ok(())
    }

    /// Load a network key into a network slot
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::Validation`] for an out-of-range slot,
    /// [`TrainerError::AckTimeout`] if the radio does not answer, or
    /// [`TrainerError::ResponseError`] if it rejects the key.
    pub async fn set_network_key(&self, network: u8, key: NetworkKey) -> Result<()> {
        let mut message = Message::new(MessageId::SetNetworkKey)
            .with_field(Field::NetworkNumber, u32::from(network))?;
        message.set_network_key(key.bytes())?;

        let response = exchange(
            self.shared.transport.as_ref(),
            &self.shared.messages,
            &message,
            &mut response_to(MessageId::SetNetworkKey),
            self.shared.response_timeout(),
        )
        .await?;
        check_response(&response, MessageId::SetNetworkKey)?;

        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(network, key);
        debug!("Network key {:?} loaded into slot {}", key, network);
        Ok(())
    }

    /// Key loaded into a network slot, if any
    #[must_use]
    pub fn network_key(&self, network: u8) -> Option<NetworkKey> {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&network)
            .copied()
    }

    /// Allocate the lowest free channel
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::NoChannelAvailable`] if every channel is in use.
    pub fn get_free_channel(&self) -> Result<Channel> {
        let number = {
            let mut allocated = self.allocated();
            let index = allocated
                .iter()
                .position(|used| !used)
                .ok_or(TrainerError::NoChannelAvailable {
                    capacity: self.shared.config.max_channels,
                })?;
            allocated[index] = true;
            u8::try_from(index).unwrap_or(u8::MAX)
        };
        debug!("Allocated channel {}", number);
        Ok(Channel::new(self.shared.clone(), number))
    }

    /// Return a channel to the pool
    pub fn free_channel(&self, channel: Channel) {
        drop(channel);
    }

    /// Number of channels not currently allocated
    #[must_use]
    pub fn free_channel_count(&self) -> usize {
        self.allocated().iter().filter(|used| !**used).count()
    }

    /// Listen to every decoded inbound message (lookup-only registration)
    pub fn add_message_listener(&self, listener: &Arc<EventListener<Message>>) {
        self.shared.messages.add_listener(listener);
    }

    /// Stop listening to inbound messages
    pub fn remove_message_listener(&self, listener: &Arc<EventListener<Message>>) -> bool {
        self.shared.messages.remove_listener(listener)
    }

    fn allocated(&self) -> MutexGuard<'_, Vec<bool>> {
        self.shared
            .allocated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
