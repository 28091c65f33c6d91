use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    sync::watch,
    time::{timeout_at, Instant},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    channel::{chained, data_prefix, event_tx, Channel, ChannelState},
    error::{Result, TrainerError},
    message::{ChannelType, Message, MessageKind},
    messenger::{EventListener, ListenerRegistry},
    node::Node,
    protocol::{
        data_packet, downhill_factor, parse_packet, Command, HeadunitPacket,
        CONNECTION_SUCCESSFUL, NO_CONNECTION,
    },
    sender::SendWorker,
    types::{BrakeConfig, ButtonPress, ControllerState, TelemetryData},
};

/// Receives telemetry from a [`BushidoBrake`]
///
/// Called on the controller's delivery task; implementations must not block.
#[allow(unused_variables)]
pub trait TelemetryListener: Send + Sync {
    /// Speed in km/h
    fn on_speed_change(&self, speed: f64) {}
    /// Power in watts
    fn on_power_change(&self, power: f64) {}
    /// Cadence in rpm
    fn on_cadence_change(&self, cadence: f64) {}
    /// Slope-compensated distance in metres
    fn on_distance_change(&self, distance: f64) {}
    /// Heart rate in bpm
    fn on_heart_rate_change(&self, heart_rate: f64) {}
}

/// Receives headunit button presses from a [`BushidoBrake`]
#[allow(unused_variables)]
pub trait ButtonPressListener: Send + Sync {
    /// A button is being held
    fn on_button_press_active(&self, press: &ButtonPress) {}
    /// A button was released
    fn on_button_press_finished(&self, press: &ButtonPress) {}
}

/// State reachable from the inbound message path
struct BrakeShared {
    config: BrakeConfig,
    telemetry: Mutex<TelemetryData>,
    distance_updates: watch::Sender<u64>,
    respond: Arc<Mutex<bool>>,
    data_request_in_progress: Arc<Mutex<bool>>,
    pause_request_in_progress: Arc<Mutex<bool>>,
    data_listeners: ListenerRegistry<dyn TelemetryListener>,
    button_listeners: ListenerRegistry<dyn ButtonPressListener>,
}

impl BrakeShared {
    fn telemetry(&self) -> MutexGuard<'_, TelemetryData> {
        self.telemetry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, message: &Message, worker: &SendWorker, channel: u8) {
        if !matches!(
            message.kind(),
            MessageKind::BroadcastData | MessageKind::AcknowledgedData
        ) {
            return;
        }
        let packet = match message.data().and_then(parse_packet) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Ignoring headunit packet: {}", e);
                return;
            }
        };

        match packet {
            HeadunitPacket::Speed {
                speed,
                power,
                cadence,
            } => {
                {
                    let mut telemetry = self.telemetry();
                    telemetry.speed = speed;
                    telemetry.power = power;
                    telemetry.cadence = cadence;
                }
                self.data_listeners.notify(|listener| {
                    listener.on_speed_change(speed);
                    listener.on_power_change(power);
                    listener.on_cadence_change(cadence);
                });
            }
            HeadunitPacket::Distance {
                distance,
                heart_rate,
            } => {
                let compensated = {
                    let mut telemetry = self.telemetry();
                    record_distance(&mut telemetry, distance);
                    telemetry.heart_rate = heart_rate;
                    telemetry.distance
                };
                self.distance_updates.send_modify(|count| *count += 1);
                self.data_listeners.notify(|listener| {
                    listener.on_distance_change(compensated);
                    listener.on_heart_rate_change(heart_rate);
                });
            }
            HeadunitPacket::Button(press) => {
                trace!("Button {} active={}", press.button, press.active);
                self.button_listeners.notify(|listener| {
                    if press.active {
                        listener.on_button_press_active(&press);
                    } else {
                        listener.on_button_press_finished(&press);
                    }
                });
            }
            HeadunitPacket::DataRequest => {
                let packet = {
                    let telemetry = self.telemetry();
                    data_packet(telemetry.slope, self.config.rider_weight)
                };
                self.reply(worker, channel, &packet, &self.data_request_in_progress);
            }
            HeadunitPacket::PauseRequest => {
                self.reply(
                    worker,
                    channel,
                    &Command::KeepAlive.packet(),
                    &self.pause_request_in_progress,
                );
            }
            HeadunitPacket::ConnectionSuccessful | HeadunitPacket::NoConnection => {
                trace!("Handshake packet {:?} outside a handshake", packet);
            }
            HeadunitPacket::Unknown => trace!("Unrecognised headunit packet {}", message),
        }
    }

    /// Queue a reply unless one for the same request type is still in flight
    fn reply(&self, worker: &SendWorker, channel: u8, data: &[u8], in_progress: &Arc<Mutex<bool>>) {
        {
            let mut busy = in_progress.lock().unwrap_or_else(PoisonError::into_inner);
            if *busy {
                trace!("Reply already in flight; dropping request");
                return;
            }
            *busy = true;
        }

        let message = match Message::broadcast(channel, data) {
            Ok(message) => message,
            Err(e) => {
                error!("Cannot build reply: {}", e);
                *in_progress.lock().unwrap_or_else(PoisonError::into_inner) = false;
                return;
            }
        };
        let flag = in_progress.clone();
        worker.submit(
            message,
            Some(Box::new(move || {
                *flag.lock().unwrap_or_else(PoisonError::into_inner) = false;
            })),
        );
    }
}

/// Accrue measured distance, scaled by the virtual downhill gain of the
/// current slope. A measured distance that goes backwards (odometer reset)
/// resets the compensated distance as well.
fn record_distance(telemetry: &mut TelemetryData, measured: f64) {
    let delta = measured - telemetry.real_distance;
    if delta >= 0.0 {
        telemetry.distance += delta * downhill_factor(telemetry.slope);
    } else {
        telemetry.distance = measured;
    }
    telemetry.real_distance = measured;
}

struct Session {
    channel: Arc<Channel>,
    worker: Arc<SendWorker>,
    rx_listener: Option<Arc<EventListener<Message>>>,
}

/// Controller for a Tacx Bushido brake, driven through the headunit protocol
///
/// ```text
/// Disconnected ─start_connection─▶ Connecting ─INIT accepted─▶ Connected
/// Connected ─reset_odometer─▶ Calibrating ─distance ≈ 0─▶ Streaming
/// Streaming ─stop─▶ Disconnecting ─▶ Disconnected
/// ```
///
/// Any handshake failure tears the session down and returns to
/// `Disconnected`; recovery means calling [`start`](Self::start) again.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use trainerlink::{BushidoBrake, BrakeConfig, Node, NodeConfig, UsbConfig, UsbTransport};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let transport = Arc::new(UsbTransport::open(UsbConfig::default())?);
///     let node = Arc::new(Node::new(transport, NodeConfig::default()));
///     let brake = BushidoBrake::new(node, BrakeConfig::default());
///
///     brake.start().await?;
///     brake.set_slope(2.5);
///     println!("{:?}", brake.telemetry());
///     brake.stop().await?;
///     Ok(())
/// }
/// ```
pub struct BushidoBrake {
    node: Arc<Node>,
    shared: Arc<BrakeShared>,
    state: Mutex<ControllerState>,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl BushidoBrake {
    /// Create a controller on top of `node`
    #[must_use]
    pub fn new(node: Arc<Node>, config: BrakeConfig) -> Self {
        let (distance_updates, _) = watch::channel(0);
        Self {
            node,
            shared: Arc::new(BrakeShared {
                config,
                telemetry: Mutex::new(TelemetryData::default()),
                distance_updates,
                respond: Arc::new(Mutex::new(true)),
                data_request_in_progress: Arc::new(Mutex::new(false)),
                pause_request_in_progress: Arc::new(Mutex::new(false)),
                data_listeners: ListenerRegistry::new(),
                button_listeners: ListenerRegistry::new(),
            }),
            state: Mutex::new(ControllerState::Disconnected),
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// Connect, reset the odometer and start cycling
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error; the controller is then
    /// `Disconnected`.
    pub async fn start(&self) -> Result<()> {
        self.start_connection().await?;
        self.reset_odometer().await?;
        if let Err(e) = self.start_cycling().await {
            self.abort().await;
            return Err(e);
        }
        Ok(())
    }

    /// Configure the channel and perform the INIT handshake
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::InvalidState`] unless disconnected,
    /// [`TrainerError::NoChannelAvailable`] / transport errors during setup, or
    /// [`TrainerError::RetryExhausted`] if the headunit never accepts INIT.
    pub async fn start_connection(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        self.require(&[ControllerState::Disconnected], "start")?;
        self.set_state(ControllerState::Connecting);

        let channel = match self.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                self.set_state(ControllerState::Disconnected);
                return Err(e);
            }
        };

        *self.shared.telemetry() = TelemetryData::default();
        *self
            .shared
            .respond
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
        let config = &self.shared.config;
        let worker = Arc::new(SendWorker::spawn(
            channel.clone(),
            self.shared.respond.clone(),
            Duration::from_millis(config.ack_timeout_ms),
            config.send_queue_depth,
        ));
        let mut current = Session {
            channel,
            worker,
            rx_listener: None,
        };

        let init = Message::broadcast(current.channel.number(), &Command::Init.packet())?;
        if let Err(e) = current
            .channel
            .send_and_wait_for_message(
                &init,
                data_prefix(&CONNECTION_SUCCESSFUL),
                Duration::from_millis(config.retry_timeout_ms),
                config.init_retries,
            )
            .await
        {
            error!("Headunit did not accept the connection: {}", e);
            self.teardown(current, false).await;
            return Err(e);
        }

        let shared = self.shared.clone();
        let worker = current.worker.clone();
        let number = current.channel.number();
        let listener: Arc<EventListener<Message>> =
            Arc::new(move |message: &Message| shared.handle(message, &worker, number));
        current.channel.add_rx_listener(&listener);
        current.rx_listener = Some(listener);

        *session = Some(current);
        self.set_state(ControllerState::Connected);
        Ok(())
    }

    /// Zero the headunit's distance counter.
    ///
    /// Data replies are suppressed until the distance has settled so stale
    /// telemetry never reaches the headunit.
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::InvalidState`] unless connected or streaming,
    /// or [`TrainerError::CalibrationTimeout`] if the distance is not
    /// reported, or does not settle, before its deadline. On timeout the
    /// session is torn down.
    pub async fn reset_odometer(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        self.require(
            &[ControllerState::Connected, ControllerState::Streaming],
            "reset odometer",
        )?;
        let Some(channel) = session.as_ref().map(|s| s.channel.clone()) else {
            return Err(self.invalid("reset odometer"));
        };
        self.set_state(ControllerState::Calibrating);

        let calibrated = self.calibrate(&channel).await;
        drop(channel);
        match calibrated {
            Ok(()) => {
                self.set_state(ControllerState::Streaming);
                info!("Odometer reset");
                Ok(())
            }
            Err(e) => {
                error!("Odometer reset failed: {}", e);
                if let Some(current) = session.take() {
                    self.teardown(current, false).await;
                }
                Err(e)
            }
        }
    }

    async fn calibrate(&self, channel: &Channel) -> Result<()> {
        let config = &self.shared.config;
        self.set_respond(false);

        let mut updates = self.shared.distance_updates.subscribe();
        let reset = Message::broadcast(channel.number(), &Command::ResetOdometer.packet())?;
        let ack_timeout = Duration::from_millis(config.ack_timeout_ms);
        channel
            .send_and_wait_for_ack(&reset, event_tx(), ack_timeout)
            .await?;

        let deadline = Instant::now() + Duration::from_millis(config.distance_update_timeout_ms);
        if timeout_at(deadline, updates.changed()).await.is_err() {
            return Err(TrainerError::CalibrationTimeout(
                "timeout waiting for distance to be updated".to_string(),
            ));
        }

        let not_reset =
            || TrainerError::CalibrationTimeout("timeout waiting for distance to be reset".to_string());
        let deadline = Instant::now() + Duration::from_millis(config.reset_odometer_timeout_ms);
        while self.real_distance() > config.distance_epsilon {
            debug!("Distance {} m after reset; resetting again", self.real_distance());
            // Each resend is bounded by whatever is left of the settle deadline
            match timeout_at(
                deadline,
                channel.send_and_wait_for_ack(&reset, event_tx(), ack_timeout),
            )
            .await
            {
                Ok(Ok(_)) => {}
                Ok(Err(TrainerError::AckTimeout { .. })) | Err(_) => return Err(not_reset()),
                Ok(Err(e)) => return Err(e),
            }
            if timeout_at(deadline, updates.changed()).await.is_err() {
                return Err(not_reset());
            }
        }

        self.set_respond(true);
        Ok(())
    }

    /// Tell the headunit to start a cycling session
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::InvalidState`] unless connected or streaming,
    /// or [`TrainerError::AckTimeout`] if the command is not transmitted.
    pub async fn start_cycling(&self) -> Result<()> {
        let session = self.session.lock().await;
        self.require(
            &[ControllerState::Connected, ControllerState::Streaming],
            "start cycling",
        )?;
        let Some(channel) = session.as_ref().map(|s| s.channel.clone()) else {
            return Err(self.invalid("start cycling"));
        };
        let start = Message::broadcast(channel.number(), &Command::Start.packet())?;
        channel
            .send_and_wait_for_ack(
                &start,
                event_tx(),
                Duration::from_millis(self.shared.config.ack_timeout_ms),
            )
            .await?;
        self.set_state(ControllerState::Streaming);
        info!("Cycling session started");
        Ok(())
    }

    /// Disconnect from the headunit and release the channel. No-op when
    /// already disconnected. The node is left running.
    ///
    /// # Errors
    ///
    /// Returns the disconnect handshake's error (usually
    /// [`TrainerError::RetryExhausted`]); the controller still ends
    /// `Disconnected`.
    pub async fn stop(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let Some(current) = session.take() else {
            self.set_state(ControllerState::Disconnected);
            return Ok(());
        };
        self.set_state(ControllerState::Disconnecting);
        self.teardown(current, true).await
    }

    async fn abort(&self) {
        let mut session = self.session.lock().await;
        if let Some(current) = session.take() {
            self.teardown(current, false).await;
        }
    }

    async fn open_channel(&self) -> Result<Arc<Channel>> {
        let config = &self.shared.config;
        self.node.start().await?;
        self.node.set_network_key(0, config.network_key).await?;

        let channel = self.node.get_free_channel()?;
        let configured = async {
            channel.assign(0, ChannelType::Slave).await?;
            channel
                .set_id(
                    config.device_number,
                    config.device_type,
                    false,
                    config.transmission_type,
                )
                .await?;
            channel.set_frequency(config.rf_frequency).await?;
            channel.set_period(config.channel_period).await?;
            channel.set_search_timeout(config.search_timeout).await?;
            channel.open().await
        }
        .await;

        match configured {
            Ok(()) => {
                debug!("Bushido channel {} open", channel.number());
                Ok(Arc::new(channel))
            }
            Err(e) => {
                release_channel(&channel).await;
                self.node.free_channel(channel);
                Err(e)
            }
        }
    }

    /// Unwind a session. With `handshake`, DISCONNECT is sent first and its
    /// failure is returned after the rest of the teardown has run.
    async fn teardown(&self, mut session: Session, handshake: bool) -> Result<()> {
        if let Some(listener) = session.rx_listener.take() {
            session.channel.remove_rx_listener(&listener);
        }

        let mut result = Ok(());
        if handshake {
            result = self.disconnect(&session.channel).await;
        }

        release_channel(&session.channel).await;
        session.worker.shutdown().await;
        drop(session.worker);
        match Arc::try_unwrap(session.channel) {
            Ok(channel) => self.node.free_channel(channel),
            Err(_) => debug!("Channel still referenced; it is freed when the last reference drops"),
        }

        self.set_respond(true);
        self.set_state(ControllerState::Disconnected);
        result
    }

    async fn disconnect(&self, channel: &Channel) -> Result<()> {
        let config = &self.shared.config;
        let message = Message::broadcast(channel.number(), &Command::Disconnect.packet())?;
        let condition = chained(vec![
            Box::new(event_tx()),
            Box::new(data_prefix(&NO_CONNECTION)),
        ]);
        channel
            .send_and_wait_for_message(
                &message,
                condition,
                Duration::from_millis(config.retry_timeout_ms),
                config.init_retries,
            )
            .await
            .map(|_| info!("Headunit disconnected"))
    }

    /// Current controller state
    #[must_use]
    pub fn state(&self) -> ControllerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consistent copy of the whole telemetry model
    #[must_use]
    pub fn telemetry(&self) -> TelemetryData {
        *self.shared.telemetry()
    }

    /// Distance as measured by the brake, without slope compensation
    #[must_use]
    pub fn real_distance(&self) -> f64 {
        self.shared.telemetry().real_distance
    }

    /// Current virtual slope in percent
    #[must_use]
    pub fn slope(&self) -> f64 {
        self.shared.telemetry().slope
    }

    /// Set the virtual slope sent with the next data reply
    pub fn set_slope(&self, slope: f64) {
        self.shared.telemetry().slope = slope;
    }

    /// Raise the slope by the configured step
    pub fn increment_slope(&self) {
        self.increment_slope_by(self.shared.config.slope_step);
    }

    /// Lower the slope by the configured step
    pub fn decrement_slope(&self) {
        self.decrement_slope_by(self.shared.config.slope_step);
    }

    /// Raise the slope by `step`
    pub fn increment_slope_by(&self, step: f64) {
        self.shared.telemetry().slope += step;
    }

    /// Lower the slope by `step`
    pub fn decrement_slope_by(&self, step: f64) {
        self.shared.telemetry().slope -= step;
    }

    /// Register a telemetry listener. The controller only holds a weak
    /// reference: keep `listener` alive for as long as it should be called.
    pub fn register_data_listener(&self, listener: &Arc<dyn TelemetryListener>) {
        self.shared.data_listeners.register(listener);
    }

    /// Unregister a telemetry listener; idempotent
    pub fn unregister_data_listener(&self, listener: &Arc<dyn TelemetryListener>) -> bool {
        self.shared.data_listeners.unregister(listener)
    }

    /// Register a button listener (weak reference, as for data listeners)
    pub fn register_button_listener(&self, listener: &Arc<dyn ButtonPressListener>) {
        self.shared.button_listeners.register(listener);
    }

    /// Unregister a button listener; idempotent
    pub fn unregister_button_listener(&self, listener: &Arc<dyn ButtonPressListener>) -> bool {
        self.shared.button_listeners.unregister(listener)
    }

    /// The brake reports speed
    #[must_use]
    pub const fn supports_speed(&self) -> bool {
        true
    }

    /// The brake reports power
    #[must_use]
    pub const fn supports_power(&self) -> bool {
        true
    }

    /// The brake reports cadence
    #[must_use]
    pub const fn supports_cadence(&self) -> bool {
        true
    }

    /// The brake has no heart-rate receiver of its own
    #[must_use]
    pub const fn supports_heart_rate(&self) -> bool {
        false
    }

    /// Node this controller runs on
    #[must_use]
    pub const fn node(&self) -> &Arc<Node> {
        &self.node
    }

    fn set_state(&self, state: ControllerState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            info!("Brake state {} -> {}", *current, state);
            *current = state;
        }
    }

    fn set_respond(&self, respond: bool) {
        *self
            .shared
            .respond
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = respond;
    }

    fn require(&self, allowed: &[ControllerState], operation: &str) -> Result<()> {
        if allowed.contains(&self.state()) {
            Ok(())
        } else {
            Err(self.invalid(operation))
        }
    }

    fn invalid(&self, operation: &str) -> TrainerError {
        TrainerError::InvalidState {
            state: format!("cannot {operation} while {}", self.state()),
        }
    }
}

/// Best-effort close and unassign; failures are logged
async fn release_channel(channel: &Channel) {
    if channel.state() == ChannelState::Open {
        if let Err(e) = channel.close().await {
            warn!("Closing channel {} failed: {}", channel.number(), e);
        }
    }
    if matches!(channel.state(), ChannelState::Assigned | ChannelState::Closed) {
        if let Err(e) = channel.unassign().await {
            warn!("Unassigning channel {} failed: {}", channel.number(), e);
        }
    }
}
