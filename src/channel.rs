use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, TrainerError},
    message::{ChannelType, Field, Message, MessageId, ResponseCode, RF_EVENT},
    messenger::{BroadcastMessenger, EventListener},
    node::{check_response, exchange, NodeShared},
};

/// Predicate over inbound messages used by the send-and-wait primitives
///
/// `reset` is called before every attempt so stateful conditions start over.
pub trait MessageCondition: Send {
    /// Whether `message` satisfies the condition
    fn test(&mut self, message: &Message) -> bool;

    /// Forget any progress made by earlier messages
    fn reset(&mut self) {}
}

impl<F> MessageCondition for F
where
    F: FnMut(&Message) -> bool + Send,
{
    fn test(&mut self, message: &Message) -> bool {
        self(message)
    }
}

/// Channel response to the command with the given id
#[derive(Debug, Clone, Copy)]
pub struct ResponseTo(MessageId);

impl MessageCondition for ResponseTo {
    fn test(&mut self, message: &Message) -> bool {
        message.id() == MessageId::ChannelEvent
            && message.field(Field::RespondingTo).ok() == Some(u32::from(self.0 as u8))
    }
}

/// Match the channel response to command `id`
#[must_use]
pub const fn response_to(id: MessageId) -> ResponseTo {
    ResponseTo(id)
}

/// Unsolicited channel event with the given code
#[derive(Debug, Clone, Copy)]
pub struct ChannelEvent(ResponseCode);

impl MessageCondition for ChannelEvent {
    fn test(&mut self, message: &Message) -> bool {
        message.id() == MessageId::ChannelEvent
            && message.field(Field::RespondingTo).ok() == Some(u32::from(RF_EVENT))
            && message.response_code().ok() == Some(self.0)
    }
}

/// Match a channel event carrying `code`
#[must_use]
pub const fn channel_event(code: ResponseCode) -> ChannelEvent {
    ChannelEvent(code)
}

/// Match the `EVENT_TX` event that follows every transmitted broadcast
#[must_use]
pub const fn event_tx() -> ChannelEvent {
    ChannelEvent(ResponseCode::Tx)
}

/// Data message whose payload starts with a fixed byte sequence
#[derive(Debug, Clone)]
pub struct DataPrefix(Vec<u8>);

impl MessageCondition for DataPrefix {
    fn test(&mut self, message: &Message) -> bool {
        message
            .data()
            .is_ok_and(|data| data.starts_with(&self.0))
    }
}

/// Match broadcast or acknowledged data starting with `prefix`
#[must_use]
pub fn data_prefix(prefix: &[u8]) -> DataPrefix {
    DataPrefix(prefix.to_vec())
}

/// Satisfied once each inner condition has matched, in order
pub struct Chained {
    conditions: Vec<Box<dyn MessageCondition>>,
    matched: usize,
}

impl MessageCondition for Chained {
    fn test(&mut self, message: &Message) -> bool {
        if let Some(condition) = self.conditions.get_mut(self.matched) {
            if condition.test(message) {
                self.matched += 1;
            }
        }
        self.matched >= self.conditions.len()
    }

    fn reset(&mut self) {
        self.matched = 0;
        for condition in &mut self.conditions {
            condition.reset();
        }
    }
}

impl fmt::Debug for Chained {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chained")
            .field("conditions", &self.conditions.len())
            .field("matched", &self.matched)
            .finish()
    }
}

/// Chain conditions so they must be satisfied one after another
#[must_use]
pub fn chained(conditions: Vec<Box<dyn MessageCondition>>) -> Chained {
    Chained {
        conditions,
        matched: 0,
    }
}

/// Channel lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Allocated but not bound to a network
    Unassigned,
    /// Bound to a network and configurable
    Assigned,
    /// Open on air
    Open,
    /// Closed; may be reopened or unassigned
    Closed,
}

/// Logical ANT channel allocated from a [`Node`](crate::node::Node)
///
/// Dropping the channel (or passing it to
/// [`Node::free_channel`](crate::node::Node::free_channel)) returns its number
/// to the pool.
pub struct Channel {
    number: u8,
    node: Arc<NodeShared>,
    state: Mutex<ChannelState>,
    rx: Arc<BroadcastMessenger<Message>>,
    forwarder: Arc<EventListener<Message>>,
    in_flight: tokio::sync::Mutex<()>,
}

impl Channel {
    pub(crate) fn new(node: Arc<NodeShared>, number: u8) -> Self {
        let rx = Arc::new(BroadcastMessenger::new("channel"));
        let republish = rx.clone();
        let forwarder: Arc<EventListener<Message>> = Arc::new(move |message: &Message| {
            if message.channel() == Some(number) {
                republish.publish(message.clone());
            }
        });
        node.messages.add_listener(&forwarder);

        Self {
            number,
            node,
            state: Mutex::new(ChannelState::Unassigned),
            rx,
            forwarder,
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    /// Channel number
    #[must_use]
    pub const fn number(&self) -> u8 {
        self.number
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.lock_state()
    }

    /// Listen to messages addressed to this channel (lookup-only registration)
    pub fn add_rx_listener(&self, listener: &Arc<EventListener<Message>>) {
        self.rx.add_listener(listener);
    }

    /// Stop listening to this channel
    pub fn remove_rx_listener(&self, listener: &Arc<EventListener<Message>>) -> bool {
        self.rx.remove_listener(listener)
    }

    /// Bind the channel to a network
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::InvalidState`] unless the channel is unassigned,
    /// or the command's validation/response error.
    pub async fn assign(&self, network: u8, channel_type: ChannelType) -> Result<()> {
        self.require(&[ChannelState::Unassigned], "assign")?;
        let message = self
            .message(MessageId::AssignChannel)?
            .with_field(Field::ChannelType, u32::from(channel_type as u8))?
            .with_field(Field::NetworkNumber, u32::from(network))?;
        self.command(&message).await?;
        self.set_state(ChannelState::Assigned);
        debug!(
            "Channel {} assigned to network {} as {:?}",
            self.number, network, channel_type
        );
        Ok(())
    }

    /// Set the channel id to search for
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::Validation`] for an out-of-range device type,
    /// [`TrainerError::InvalidState`] on an unassigned channel, or the
    /// command's response error.
    pub async fn set_id(
        &self,
        device_number: u16,
        device_type: u8,
        pairing: bool,
        transmission_type: u8,
    ) -> Result<()> {
        self.require_assigned("set_id")?;
        let message = self
            .message(MessageId::ChannelId)?
            .with_field(Field::DeviceNumber, u32::from(device_number))?
            .with_field(Field::DeviceType, u32::from(device_type))?
            .with_field(Field::PairingFlag, u32::from(pairing))?
            .with_field(Field::TransmissionType, u32::from(transmission_type))?;
        self.command(&message).await
    }

    /// Set the RF frequency (offset from 2400 MHz)
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::Validation`] above 124, or the command's error.
    pub async fn set_frequency(&self, frequency: u8) -> Result<()> {
        self.require_assigned("set_frequency")?;
        let message = self
            .message(MessageId::RfFrequency)?
            .with_field(Field::RfFrequency, u32::from(frequency))?;
        self.command(&message).await
    }

    /// Set the message period in 1/32768 s
    ///
    /// # Errors
    ///
    /// Returns the command's state or response error.
    pub async fn set_period(&self, period: u16) -> Result<()> {
        self.require_assigned("set_period")?;
        let message = self
            .message(MessageId::ChannelPeriod)?
            .with_field(Field::Period, u32::from(period))?;
        self.command(&message).await
    }

    /// Set the search timeout in 2.5 s units
    ///
    /// # Errors
    ///
    /// Returns the command's state or response error.
    pub async fn set_search_timeout(&self, timeout: u8) -> Result<()> {
        self.require_assigned("set_search_timeout")?;
        let message = self
            .message(MessageId::SearchTimeout)?
            .with_field(Field::SearchTimeout, u32::from(timeout))?;
        self.command(&message).await
    }

    /// Open the channel
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::InvalidState`] unless assigned or closed, or the
    /// command's response error.
    pub async fn open(&self) -> Result<()> {
        self.require(&[ChannelState::Assigned, ChannelState::Closed], "open")?;
        self.command(&self.message(MessageId::OpenChannel)?).await?;
        self.set_state(ChannelState::Open);
        info!("Channel {} open", self.number);
        Ok(())
    }

    /// Close the channel and wait for the radio to report it closed
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::InvalidState`] unless open, the command's
    /// response error, or [`TrainerError::AckTimeout`] if the closed event
    /// never arrives.
    pub async fn close(&self) -> Result<()> {
        self.require(&[ChannelState::Open], "close")?;
        let message = self.message(MessageId::CloseChannel)?;
        let timeout = self.node.response_timeout();

        let mut saw_response = false;
        let closed = |received: &Message| {
            if response_to(MessageId::CloseChannel).test(received) {
                saw_response = true;
                if let Err(e) = check_response(received, MessageId::CloseChannel) {
                    warn!("Close on channel {} answered with {}", self.number, e);
                }
            }
            channel_event(ResponseCode::ChannelClosed).test(received)
        };
        self.send_and_wait_for_ack(&message, closed, timeout).await?;
        if !saw_response {
            debug!("Channel {} closed without a command response", self.number);
        }
        self.set_state(ChannelState::Closed);
        info!("Channel {} closed", self.number);
        Ok(())
    }

    /// Release the channel's network binding
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::InvalidState`] while open or unassigned, or the
    /// command's response error.
    pub async fn unassign(&self) -> Result<()> {
        self.require(&[ChannelState::Assigned, ChannelState::Closed], "unassign")?;
        self.command(&self.message(MessageId::UnassignChannel)?)
            .await?;
        self.set_state(ChannelState::Unassigned);
        debug!("Channel {} unassigned", self.number);
        Ok(())
    }

    /// Write a message without waiting for anything
    ///
    /// # Errors
    ///
    /// Propagates transport failures.
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.node.transport.send(message.encode()).await
    }

    /// Send `message` and wait for a message on this channel satisfying
    /// `condition`, bounded by `timeout`
    ///
    /// At most one exchange is in flight per channel; concurrent callers queue.
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::AckTimeout`] if nothing matches in time, or a
    /// transport failure.
    pub async fn send_and_wait_for_ack(
        &self,
        message: &Message,
        mut condition: impl MessageCondition,
        timeout: Duration,
    ) -> Result<Message> {
        self.exchange(message, &mut condition, timeout).await
    }

    /// Repeat [`send_and_wait_for_ack`](Self::send_and_wait_for_ack) up to
    /// `max_retries` times, each attempt bounded by `timeout_per_attempt`.
    ///
    /// Attempts follow each other immediately; there is no backoff.
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::RetryExhausted`] carrying the last timeout once
    /// every attempt has timed out. Other errors are returned immediately.
    pub async fn send_and_wait_for_message(
        &self,
        message: &Message,
        mut condition: impl MessageCondition,
        timeout_per_attempt: Duration,
        max_retries: u32,
    ) -> Result<Message> {
        let mut last_error = TrainerError::AckTimeout {
            timeout_ms: u64::try_from(timeout_per_attempt.as_millis()).unwrap_or(u64::MAX),
        };
        for attempt in 1..=max_retries {
            match self
                .exchange(message, &mut condition, timeout_per_attempt)
                .await
            {
                Ok(response) => return Ok(response),
                Err(e @ TrainerError::AckTimeout { .. }) => {
                    debug!(
                        "Channel {}: attempt {}/{} timed out",
                        self.number, attempt, max_retries
                    );
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        warn!(
            "Channel {}: no matching reply to {} after {} attempts",
            self.number, message, max_retries
        );
        Err(TrainerError::RetryExhausted {
            attempts: max_retries,
            source: Box::new(last_error),
        })
    }

    async fn exchange(
        &self,
        message: &Message,
        condition: &mut dyn MessageCondition,
        timeout: Duration,
    ) -> Result<Message> {
        let _in_flight = self.in_flight.lock().await;
        exchange(
            self.node.transport.as_ref(),
            &self.rx,
            message,
            condition,
            timeout,
        )
        .await
    }

    async fn command(&self, message: &Message) -> Result<()> {
        let response = self
            .send_and_wait_for_ack(
                message,
                response_to(message.id()),
                self.node.response_timeout(),
            )
            .await?;
        check_response(&response, message.id())
    }

    fn message(&self, id: MessageId) -> Result<Message> {
        Message::on_channel(id, self.number)
    }

    fn require(&self, allowed: &[ChannelState], operation: &str) -> Result<()> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(TrainerError::InvalidState {
                state: format!("cannot {operation} channel {} while {state:?}", self.number),
            })
        }
    }

    fn require_assigned(&self, operation: &str) -> Result<()> {
        self.require(
            &[ChannelState::Assigned, ChannelState::Open, ChannelState::Closed],
            operation,
        )
    }

    fn lock_state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ChannelState) {
        *self.lock_state() = state;
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.node.messages.remove_listener(&self.forwarder);
        self.node.release(self.number);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("number", &self.number)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::DeviceIdentity,
        node::Node,
        testing::{radio_responses, ScriptedTransport},
        types::{NetworkKey, NodeConfig},
    };
    use tokio_test::{assert_err, assert_ok};

    async fn started_node(transport: &Arc<ScriptedTransport>) -> Node {
        let node = Node::new(transport.clone(), NodeConfig::default());
        assert_ok!(node.start().await);
        node
    }

    fn broadcast(data: &[u8]) -> Message {
        Message::broadcast(0, data).unwrap()
    }

    #[test]
    fn test_chained_condition_order() {
        let mut condition = chained(vec![
            Box::new(event_tx()),
            Box::new(data_prefix(&[0xAD, 0x01, 0x00])),
        ]);
        let tx = Message::channel_event(0, RF_EVENT, ResponseCode::Tx);
        let no_connection = broadcast(&[0xAD, 0x01, 0x00]);

        assert!(!condition.test(&no_connection));
        assert!(!condition.test(&tx));
        assert!(condition.test(&no_connection));

        condition.reset();
        assert!(!condition.test(&no_connection));
    }

    #[test]
    fn test_data_prefix_ignores_non_data() {
        let mut condition = data_prefix(&[0xAD, 0x01, 0x04]);
        assert!(condition.test(&broadcast(&[0xAD, 0x01, 0x04, 0x00])));
        assert!(!condition.test(&broadcast(&[0xAD, 0x01, 0x00])));
        assert!(!condition.test(&Message::channel_event(0, 0xAD, ResponseCode::NoError)));

        let mut extended = broadcast(&[0xAD, 0x01, 0x04]);
        extended
            .set_device_info(DeviceIdentity::new(1, 0x52, false, 1).unwrap())
            .unwrap();
        assert!(condition.test(&extended));
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_lifecycle() {
        let transport = ScriptedTransport::new(radio_responses);
        let node = started_node(&transport).await;
        assert_ok!(node.set_network_key(0, NetworkKey::PUBLIC).await);

        let channel = node.get_free_channel().unwrap();
        assert_eq!(channel.state(), ChannelState::Unassigned);
        assert_err!(channel.open().await);

        assert_ok!(channel.assign(0, ChannelType::Slave).await);
        assert_ok!(channel.set_id(0, 0x52, false, 0).await);
        assert_ok!(channel.set_frequency(60).await);
        assert_ok!(channel.set_period(4096).await);
        assert_ok!(channel.set_search_timeout(255).await);
        assert_ok!(channel.open().await);
        assert_eq!(channel.state(), ChannelState::Open);

        assert_ok!(channel.close().await);
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_ok!(channel.unassign().await);
        assert_eq!(channel.state(), ChannelState::Unassigned);

        let sent: Vec<MessageId> = transport.sent().iter().map(Message::id).collect();
        assert_eq!(
            &sent[sent.len() - 3..],
            &[
                MessageId::OpenChannel,
                MessageId::CloseChannel,
                MessageId::UnassignChannel
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_command_surfaces_response_error() {
        let transport = ScriptedTransport::new(|message: &Message| {
            if message.id() == MessageId::RfFrequency {
                vec![Message::channel_event(
                    0,
                    MessageId::RfFrequency as u8,
                    ResponseCode::ChannelInWrongState,
                )]
            } else {
                radio_responses(message)
            }
        });
        let node = started_node(&transport).await;
        let channel = node.get_free_channel().unwrap();
        assert_ok!(channel.assign(0, ChannelType::Slave).await);

        match channel.set_frequency(60).await {
            Err(TrainerError::ResponseError { id, code }) => {
                assert_eq!(id, 0x45);
                assert_eq!(code, 0x15);
            }
            other => panic!("expected response error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_frequency_rejected_before_io() {
        let transport = ScriptedTransport::new(radio_responses);
        let node = started_node(&transport).await;
        let channel = node.get_free_channel().unwrap();
        assert_ok!(channel.assign(0, ChannelType::Slave).await);
        let before = transport.sent().len();

        assert!(matches!(
            channel.set_frequency(200).await,
            Err(TrainerError::Validation {
                field: "rf_frequency",
                ..
            })
        ));
        assert_eq!(transport.sent().len(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timeout() {
        let transport = ScriptedTransport::new(radio_responses);
        let node = started_node(&transport).await;
        let channel = node.get_free_channel().unwrap();

        let started = tokio::time::Instant::now();
        let result = channel
            .send_and_wait_for_ack(&broadcast(&[1]), event_tx(), Duration::from_secs(10))
            .await;
        assert!(matches!(
            result,
            Err(TrainerError::AckTimeout { timeout_ms: 10_000 })
        ));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(10) && waited < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_issues_exactly_max_attempts() {
        let transport = ScriptedTransport::new(radio_responses);
        let node = started_node(&transport).await;
        let channel = node.get_free_channel().unwrap();
        let before = transport.sent().len();

        let started = tokio::time::Instant::now();
        let result = channel
            .send_and_wait_for_message(
                &broadcast(&[0xAC, 0x03, 0x04]),
                |_: &Message| false,
                Duration::from_secs(1),
                5,
            )
            .await;

        match result {
            Err(TrainerError::RetryExhausted { attempts, source }) => {
                assert_eq!(attempts, 5);
                assert!(matches!(*source, TrainerError::AckTimeout { timeout_ms: 1000 }));
            }
            other => panic!("expected retry exhaustion, got {other:?}"),
        }
        assert_eq!(transport.sent().len() - before, 5);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rx_listener_only_sees_own_channel() {
        let transport = ScriptedTransport::new(radio_responses);
        let node = started_node(&transport).await;
        let first = node.get_free_channel().unwrap();
        let second = node.get_free_channel().unwrap();
        assert_eq!(second.number(), 1);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let listener: Arc<EventListener<Message>> = Arc::new(move |message: &Message| {
            let _ = tx.send(message.channel());
        });
        second.add_rx_listener(&listener);

        transport.inject(&Message::broadcast(0, &[1]).unwrap());
        transport.inject(&Message::broadcast(1, &[2]).unwrap());
        assert_eq!(rx.recv().await, Some(Some(1)));
        drop(first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_pool_exhaustion_and_release() {
        let transport = ScriptedTransport::new(radio_responses);
        let node = Node::new(
            transport.clone(),
            NodeConfig {
                max_channels: 2,
                ..NodeConfig::default()
            },
        );
        let a = node.get_free_channel().unwrap();
        let _b = node.get_free_channel().unwrap();
        assert!(matches!(
            node.get_free_channel(),
            Err(TrainerError::NoChannelAvailable { capacity: 2 })
        ));

        node.free_channel(a);
        assert_eq!(node.free_channel_count(), 1);
        assert_eq!(node.get_free_channel().unwrap().number(), 0);
    }
}
