use crate::domain::{
    CommandDispatcher, CommandPublisher, CommandStatusBook, CommandStatusEntry, CommandTimers,
    DeviceRegistry, DeviceSyncConfig, DeviceView, FeedNotifier, ReadSideFeed, StateReconciler,
    TransportStatus,
};
use crate::mqtt::run_mqtt_subscriber;
use chrono::Utc;
use common::domain::{
    CommandHandle, CommandRequest, Device, DeviceCommand, DeviceRepository, DeviceStateStore,
    DomainResult, IssueCommandInput,
};
use rumqttc::{AsyncClient, EventLoop};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// A long-running process in the shape the service runner expects
pub type RunnerProcess = Box<
    dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send,
>;

/// One device's share of a command sent to every device
#[derive(Debug)]
pub struct FanOutResult {
    pub device_id: String,
    pub result: DomainResult<CommandHandle>,
}

/// The synchronization core: registry, reconciler, dispatcher and read side
/// wired over one store and one transport
pub struct DeviceSync {
    config: DeviceSyncConfig,
    registry: Arc<DeviceRegistry>,
    reconciler: Arc<StateReconciler>,
    dispatcher: CommandDispatcher,
    feed: Arc<ReadSideFeed>,
    transport_status: TransportStatus,
}

impl DeviceSync {
    pub fn new(
        config: DeviceSyncConfig,
        devices: Arc<dyn DeviceRepository>,
        states: Arc<dyn DeviceStateStore>,
        publisher: Arc<dyn CommandPublisher>,
        notifier: Arc<dyn FeedNotifier>,
        shutdown_token: CancellationToken,
    ) -> Self {
        debug!("initializing device sync core");

        let registry = Arc::new(DeviceRegistry::new(
            devices,
            Arc::clone(&notifier),
            config.staleness_window(),
        ));
        let timers = CommandTimers::new();
        let status_book = Arc::new(CommandStatusBook::new(Arc::clone(&notifier)));

        let reconciler = Arc::new(StateReconciler::new(
            Arc::clone(&states),
            Arc::clone(&registry),
            timers.clone(),
            Arc::clone(&status_book),
            notifier,
        ));
        let dispatcher = CommandDispatcher::new(
            Arc::clone(&reconciler),
            publisher,
            timers,
            config.command_timeout(),
            config.retry_count,
            shutdown_token,
        );
        let feed = Arc::new(ReadSideFeed::new(
            Arc::clone(&registry),
            states,
            status_book,
        ));

        Self {
            config,
            registry,
            reconciler,
            dispatcher,
            feed,
            transport_status: TransportStatus::new(),
        }
    }

    /// Load known devices; call once before processing messages
    pub async fn start(&self) -> DomainResult<usize> {
        let count = self.registry.load().await?;
        info!(devices = count, "device sync core started");
        Ok(count)
    }

    pub async fn issue_command(&self, input: IssueCommandInput) -> DomainResult<CommandHandle> {
        self.dispatcher.issue(input).await
    }

    /// Send one command to every known device, online or not.
    ///
    /// An invalid command fails the whole call before anything is issued;
    /// per-device failures are reported in the results.
    #[instrument(skip(self, command))]
    pub async fn issue_to_all(
        &self,
        session_id: Option<String>,
        command: CommandRequest,
    ) -> DomainResult<Vec<FanOutResult>> {
        DeviceCommand::try_from(command.clone())?;

        let devices = self.registry.list_devices().await?;
        let mut results = Vec::with_capacity(devices.len());
        for device in devices {
            let result = self
                .dispatcher
                .issue(IssueCommandInput {
                    device_id: device.device_id.clone(),
                    session_id: session_id.clone(),
                    command: command.clone(),
                })
                .await;
            if let Err(e) = &result {
                warn!(device_id = %device.device_id, error = %e, "fan-out command not issued");
            }
            results.push(FanOutResult {
                device_id: device.device_id,
                result,
            });
        }

        info!(devices = results.len(), "command sent to all devices");
        Ok(results)
    }

    /// Whether the broker connection is currently up
    pub fn transport_connected(&self) -> bool {
        self.transport_status.is_connected()
    }

    pub fn transport_status(&self) -> &TransportStatus {
        &self.transport_status
    }

    pub async fn list_devices(&self, session_id: Option<&str>) -> DomainResult<Vec<DeviceView>> {
        self.feed.list_devices(session_id).await
    }

    pub async fn get_device(
        &self,
        device_id: &str,
        session_id: Option<&str>,
    ) -> DomainResult<DeviceView> {
        self.feed.get_device(device_id, session_id).await
    }

    pub async fn command_status(&self, command_id: &str) -> Option<CommandStatusEntry> {
        self.feed.command_status(command_id).await
    }

    pub async fn rename_device(
        &self,
        device_id: &str,
        friendly_name: Option<&str>,
    ) -> DomainResult<Device> {
        self.registry.rename(device_id, friendly_name).await
    }

    pub fn config(&self) -> &DeviceSyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn reconciler(&self) -> &Arc<StateReconciler> {
        &self.reconciler
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn feed(&self) -> &Arc<ReadSideFeed> {
        &self.feed
    }

    /// MQTT ingestion process over an already created client and event loop
    pub fn mqtt_subscriber_process(&self, client: AsyncClient, eventloop: EventLoop) -> RunnerProcess {
        let reconciler = Arc::clone(&self.reconciler);
        let config = self.config.clone();
        let status = self.transport_status.clone();
        Box::new(move |ctx| {
            Box::pin(async move {
                run_mqtt_subscriber(client, eventloop, reconciler, config, status, ctx).await
            })
        })
    }

    /// Periodic liveness sweep publishing online/offline flips
    pub fn liveness_process(&self) -> RunnerProcess {
        let registry = Arc::clone(&self.registry);
        let interval = self.config.liveness_sweep_interval();
        Box::new(move |ctx| Box::pin(run_liveness_monitor(registry, interval, ctx)))
    }
}

pub async fn run_liveness_monitor(
    registry: Arc<DeviceRegistry>,
    interval: Duration,
    shutdown_token: CancellationToken,
) -> anyhow::Result<()> {
    if interval.is_zero() {
        anyhow::bail!("liveness sweep interval must be non-zero");
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_token.cancelled() => break,
            _ = ticker.tick() => {
                let flipped = registry.sweep_liveness(Utc::now()).await;
                if !flipped.is_empty() {
                    debug!(count = flipped.len(), "liveness sweep found changes");
                }
            }
        }
    }

    debug!("liveness monitor stopped");
    Ok(())
}
