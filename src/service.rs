// SPDX-License-Identifier: GPL-3.0-or-later
use std::collections::HashSet;
use std::io;
use std::pin::Pin;

use anyhow::{anyhow, Context as _};
use chrono::Utc;
use futures::future::{Fuse, FusedFuture, Future, FutureExt};
use rumqttc::{AsyncClient, QoS};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Duration, Instant};
use tracing::{debug, info, warn};

use crate::expiry::{TimerFired, TokioScheduler};
use crate::mqtt::{ClientMessage, MqttClient, State, Status};
use crate::sensor::{MqttSensor, RestoreStore, SensorState, StateWrite};
use crate::settings::Settings;
use crate::util::flatten_join_result;

type ClientTask = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// How many incoming MQTT events can be waiting for the service loop.
const MESSAGE_CAPACITY: usize = 64;

/// How long to give the MQTT client to flush the last messages when shutting down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug)]
enum Event {
    Client(ClientMessage),
    Timer(TimerFired),
    Save,
    Shutdown(io::Result<()>),
    ClientExited(anyhow::Result<()>),
}

/// Drives all of the configured sensors from a single task.
///
/// MQTT messages, expiry timers, and the periodic restore state saves are all handled one at a
/// time in [Service::run], so sensor state is never shared between tasks.
pub(crate) struct Service {
    sensors: Vec<MqttSensor<TokioScheduler>>,
    states: Vec<State<SensorState>>,
    status: State<Status>,
    store: RestoreStore,
    save_interval: Duration,
    connected: bool,
    client: AsyncClient,
    messages: mpsc::Receiver<ClientMessage>,
    timers: mpsc::UnboundedReceiver<TimerFired>,
    client_task: Fuse<ClientTask>,
}

impl Service {
    pub(crate) fn new(settings: Settings) -> anyhow::Result<Self> {
        let mqtt_client = MqttClient::new(&settings.mqtt).context("Error configuring MQTT client")?;
        let client = mqtt_client.sender();
        let (message_sender, messages) = mpsc::channel(MESSAGE_CAPACITY);
        info!(server = %settings.mqtt.server_url(), "Opening connection to MQTT broker");
        let client_task = tokio::spawn(mqtt_client.run_loop(message_sender))
            .map(flatten_join_result)
            .boxed();
        Self::with_client(settings, client, messages, client_task)
    }

    fn with_client(
        settings: Settings,
        client: AsyncClient,
        messages: mpsc::Receiver<ClientMessage>,
        client_task: ClientTask,
    ) -> anyhow::Result<Self> {
        let mut store = RestoreStore::load(&settings.restore.path)?;
        let (timer_sender, timers) = mpsc::unbounded_channel();
        let now = Utc::now();
        let mut sensors = Vec::with_capacity(settings.sensors.len());
        let mut states = Vec::with_capacity(settings.sensors.len());
        for (index, sensor_settings) in settings.sensors.into_iter().enumerate() {
            let scheduler = TokioScheduler::new(index, timer_sender.clone());
            let mut sensor = MqttSensor::new(sensor_settings, scheduler);
            if let Some(stored) = store.take(sensor.unique_id()) {
                sensor.restore(stored, now);
            }
            let topic = settings.mqtt.sensor_state_topic(sensor.unique_id());
            debug!(
                sensor = sensor.unique_id(),
                %topic,
                expired = ?sensor.is_expired(),
                "Created sensor"
            );
            states.push(State::new(sensor.state(), topic, true, QoS::AtLeastOnce));
            sensors.push(sensor);
        }
        Ok(Self {
            sensors,
            states,
            status: State::new_default_at(settings.mqtt.status_topic()),
            store,
            save_interval: settings.restore.save_interval(),
            connected: false,
            client,
            messages,
            timers,
            client_task: client_task.fuse(),
        })
    }

    /// Run until a shutdown signal is received or the MQTT client stops.
    pub(crate) async fn run(mut self) -> anyhow::Result<()> {
        let mut save_timer = interval_at(Instant::now() + self.save_interval, self.save_interval);
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        let result = loop {
            let event = tokio::select! {
                Some(message) = self.messages.recv() => Event::Client(message),
                Some(fired) = self.timers.recv() => Event::Timer(fired),
                _ = save_timer.tick() => Event::Save,
                res = &mut shutdown => Event::Shutdown(res),
                res = &mut self.client_task => Event::ClientExited(res),
            };
            match event {
                Event::Client(message) => self.handle_client_message(message).await,
                Event::Timer(fired) => self.handle_timer(fired).await,
                Event::Save => self.save(),
                Event::Shutdown(res) => {
                    info!("Shutting down");
                    break res.context("Error waiting for shutdown signal");
                }
                Event::ClientExited(res) => {
                    warn!(result = ?res, "MQTT client stopped");
                    break res.and(Err(anyhow!("MQTT client stopped unexpectedly")));
                }
            }
        };
        self.shutdown().await;
        result
    }

    async fn handle_client_message(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Connected => self.handle_connected().await,
            ClientMessage::Disconnected => {
                info!("Lost connection to MQTT broker");
                self.connected = false;
                for (sensor, state) in self.sensors.iter_mut().zip(self.states.iter_mut()) {
                    if let Some(write) = sensor.set_connected(false) {
                        state.update(write.state);
                    }
                }
            }
            ClientMessage::Publish { topic, payload } => {
                let now = Utc::now();
                let mut handled = false;
                for index in 0..self.sensors.len() {
                    if !self.sensors[index].subscribes_to(&topic) {
                        continue;
                    }
                    handled = true;
                    let write = self.sensors[index].handle_message(&topic, &payload, now);
                    self.write_state(index, write).await;
                }
                if !handled {
                    debug!(%topic, "Message on a topic no sensor is interested in");
                }
            }
        }
    }

    async fn handle_connected(&mut self) {
        self.connected = true;
        // Subscriptions are lost with the session, so redo them on every connection.
        let mut subscribed = HashSet::new();
        for sensor in self.sensors.iter() {
            let settings = sensor.settings();
            let topics = std::iter::once(settings.state_topic.as_str())
                .chain(settings.availability_topic.as_deref());
            for topic in topics {
                if !subscribed.insert(topic.to_string()) {
                    continue;
                }
                debug!(%topic, qos = ?settings.qos(), "Subscribing");
                if let Err(err) = self.client.subscribe(topic, settings.qos()).await {
                    warn!(%topic, "Unable to subscribe: {:?}", err);
                }
            }
        }
        if let Err(err) = self
            .status
            .publish_if_update(Status::Online, true, &self.client)
            .await
        {
            warn!("Unable to publish service status: {:?}", err);
        }
        for index in 0..self.sensors.len() {
            self.sensors[index].set_connected(true);
            let state = self.sensors[index].state();
            // Always publish on connection, the retained state may be from a previous run.
            self.write_state(
                index,
                Some(StateWrite {
                    state,
                    force: true,
                }),
            )
            .await;
        }
    }

    async fn handle_timer(&mut self, fired: TimerFired) {
        let write = match self.sensors.get_mut(fired.sensor) {
            Some(sensor) => sensor.handle_timer(fired.handle),
            None => {
                warn!(?fired, "Timer fired for an unknown sensor");
                return;
            }
        };
        self.write_state(fired.sensor, write).await;
    }

    async fn write_state(&mut self, index: usize, write: Option<StateWrite>) {
        let write = match write {
            Some(write) => write,
            None => return,
        };
        let state = &mut self.states[index];
        if !self.connected {
            // Published once the connection comes back.
            state.update(write.state);
            return;
        }
        if let Err(err) = state
            .publish_if_update(write.state, write.force, &self.client)
            .await
        {
            warn!(topic = state.topic(), "Unable to publish sensor state: {:?}", err);
        }
    }

    fn save(&mut self) {
        for sensor in self.sensors.iter() {
            self.store.update(sensor.unique_id(), sensor.stored_state());
        }
        if let Err(err) = self.store.save() {
            warn!("Unable to save sensor states: {:?}", err);
        }
    }

    async fn shutdown(mut self) {
        for sensor in self.sensors.iter_mut() {
            sensor.dispose();
        }
        self.save();
        if self.connected {
            if let Err(err) = self
                .status
                .publish_if_update(Status::Offline, true, &self.client)
                .await
            {
                warn!("Unable to publish service status: {:?}", err);
            }
        }
        if let Err(err) = self.client.disconnect().await {
            debug!("Unable to request disconnection: {:?}", err);
        }
        let Self {
            messages,
            client_task,
            ..
        } = self;
        // The client loop stops once nothing is listening to it anymore.
        drop(messages);
        if !client_task.is_terminated() && timeout(SHUTDOWN_GRACE, client_task).await.is_err() {
            debug!("MQTT client did not stop in time");
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> io::Result<()> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        res = signal::ctrl_c() => res,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> io::Result<()> {
    signal::ctrl_c().await
}
