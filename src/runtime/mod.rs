use crate::activity::ActivityDebouncer;
use crate::connection::MqttLink;
use crate::media::MediaReconciler;
use crate::router::CommandRouter;
use crate::status::StatusPublisher;
use crate::topics::Topics;
use std::convert::Infallible;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A named background task that is started at most once at a time. The
/// supervisor wrapper logs how the task ended.
pub struct TaskSlot {
    name: &'static str,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskSlot {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Spawns `start()` unless the previous instance is still alive. Returns
    /// whether a new instance was started.
    pub fn ensure_running<F, Fut, E>(&self, start: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let mut slot = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            tracing::debug!("{} task already running", self.name);
            return false;
        }

        let name = self.name;
        let inner = tokio::spawn(start());
        *slot = Some(tokio::spawn(async move {
            match inner.await {
                Ok(Ok(())) => tracing::info!("{} task finished", name),
                Ok(Err(err)) => tracing::warn!("{} task stopped: {}", name, err),
                Err(err) if err.is_panic() => tracing::error!("{} task panicked: {}", name, err),
                Err(_) => tracing::debug!("{} task cancelled", name),
            }
        }));
        tracing::info!("Started {} task", name);
        true
    }
}

pub struct MediaStream {
    pub reconciler: Arc<MediaReconciler>,
    pub command: String,
}

/// What happens on every (re)connect and for every inbound message.
pub struct Runtime {
    topics: Topics,
    link: Arc<dyn MqttLink>,
    status: Arc<StatusPublisher>,
    router: Arc<CommandRouter>,
    activity: Arc<ActivityDebouncer>,
    media: Option<MediaStream>,
    media_task: TaskSlot,
    activity_task: TaskSlot,
}

impl Runtime {
    pub fn new(
        topics: Topics,
        link: Arc<dyn MqttLink>,
        status: Arc<StatusPublisher>,
        router: Arc<CommandRouter>,
        activity: Arc<ActivityDebouncer>,
        media: Option<MediaStream>,
    ) -> Self {
        Self {
            topics,
            link,
            status,
            router,
            activity,
            media,
            media_task: TaskSlot::new("media stream"),
            activity_task: TaskSlot::new("user activity"),
        }
    }

    /// Advertises the device, subscribes, restarts background tasks that
    /// have ended and republishes every quantity.
    pub async fn on_connect(&self) {
        tracing::info!("Connected to MQTT");
        self.status.publish_discovery().await;
        self.status.publish_alive(true);
        tracing::info!("Sending 'online' to topic: {}", self.topics.alive());

        let filter = self.topics.command_filter();
        match self.link.subscribe(&filter) {
            Ok(()) => tracing::info!("Subscribed to topic: {}", filter),
            Err(err) => tracing::warn!("Failed to subscribe to {}: {}", filter, err),
        }

        self.start_background();
        self.status.resync().await;
    }

    fn start_background(&self) {
        if let Some(media) = &self.media {
            let reconciler = Arc::clone(&media.reconciler);
            let command = media.command.clone();
            self.media_task
                .ensure_running(move || reconciler.run(command));
        }
        let activity = Arc::clone(&self.activity);
        self.activity_task.ensure_running(move || async move {
            activity.run().await;
            Ok::<(), Infallible>(())
        });
    }

    /// The session driver reconnects on its own; nothing to do inline.
    pub fn on_connection_lost(&self, reason: &str) {
        tracing::warn!("Disconnected from MQTT: {}", reason);
        tracing::info!("MQTT client will attempt to reconnect automatically...");
    }

    /// Handles inbound messages one at a time in arrival order, so the last
    /// command sent for a topic is the one that sticks.
    pub async fn process_messages(self: Arc<Self>, mut inbox: mpsc::Receiver<(String, String)>) {
        while let Some((topic, payload)) = inbox.recv().await {
            self.handle_message(&topic, &payload).await;
        }
        tracing::debug!("Command inbox closed");
    }

    pub async fn handle_message(&self, topic: &str, payload: &str) {
        tracing::debug!("Received message: {} from topic: {}", payload, topic);
        if !self.router.route(topic, payload).await {
            tracing::debug!("No handler for {}", topic);
        }
    }
}
