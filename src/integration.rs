use crate::config::Credentials;
use crate::ecobulles::{DeviceRecord, EcobullesClient};
use crate::error::{EcobullesError, SetupErrorCode};
use crate::poll_coordinator::PollTask;
use crate::sensors::{
    spawn_sensor_publisher, Co2UsageSensor, EntityPublisher, Sensor, WaterUsageSensor, DOMAIN,
    MANUFACTURER, MODEL,
};
use crate::usage_coordinator::{usage_coordinator, UsageCoordinator};
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Everything persisted for one configured account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub entry_id: String,
    /// The account email; one entry per account.
    pub unique_id: String,
    pub title: String,
    pub credentials: Credentials,
    pub user_id: String,
    pub device: DeviceRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedAccount {
    pub title: String,
    pub user_id: String,
    pub device_ref: String,
}

/// Setup and options forms: turns credentials into a [`ConfigEntry`].
pub struct ConfigFlow {
    client: EcobullesClient,
}

impl ConfigFlow {
    pub fn new(client: EcobullesClient) -> Self {
        Self { client }
    }

    /// Checks that the credentials log in.
    pub async fn validate_input(
        &self,
        credentials: &Credentials,
    ) -> Result<ValidatedAccount, EcobullesError> {
        let auth = self
            .client
            .authenticate(&credentials.email, &credentials.password)
            .await?;
        Ok(ValidatedAccount {
            title: format!("Ecobulles : {}", auth.device_name),
            user_id: auth.user_id,
            device_ref: auth.device_ref,
        })
    }

    /// Initial setup form.
    pub async fn submit(
        &self,
        entry_id: impl Into<String>,
        credentials: Credentials,
    ) -> Result<ConfigEntry, SetupErrorCode> {
        self.build_entry(entry_id.into(), credentials).await
    }

    /// Options form: re-authenticates and replaces the device record wholesale.
    pub async fn reconfigure(
        &self,
        existing: &ConfigEntry,
        credentials: Credentials,
    ) -> Result<ConfigEntry, SetupErrorCode> {
        self.build_entry(existing.entry_id.clone(), credentials).await
    }

    async fn build_entry(
        &self,
        entry_id: String,
        credentials: Credentials,
    ) -> Result<ConfigEntry, SetupErrorCode> {
        let result = async {
            let account = self.validate_input(&credentials).await?;
            let device = self.client.fetch_device_info(&account.device_ref).await?;
            Ok::<_, EcobullesError>((account, device))
        }
        .await;

        let (account, device) = result.map_err(|e| {
            let code = SetupErrorCode::from(&e);
            match code {
                SetupErrorCode::Unknown => error!("Unexpected error during setup: {e}"),
                _ => warn!("Setup failed ({code}): {e}"),
            }
            code
        })?;

        info!("Configured {} ({})", account.title, account.device_ref);
        Ok(ConfigEntry {
            entry_id,
            unique_id: credentials.email.clone(),
            title: account.title,
            credentials,
            user_id: account.user_id,
            device,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRegistration {
    pub config_entry_id: String,
    pub identifier: (String, String),
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub sw_version: String,
    pub serial_number: String,
}

impl DeviceRegistration {
    fn for_entry(entry: &ConfigEntry) -> Self {
        Self {
            config_entry_id: entry.entry_id.clone(),
            identifier: (DOMAIN.to_string(), entry.device.device_ref.clone()),
            name: entry.device.name.clone(),
            manufacturer: MANUFACTURER.to_string(),
            model: MODEL.to_string(),
            sw_version: entry.device.firmware_version.clone(),
            serial_number: entry.device.serial_number.clone(),
        }
    }
}

/// Host device registry, keyed by device reference.
pub trait DeviceRegistry: Send {
    fn get_or_create(&mut self, registration: DeviceRegistration);
}

#[derive(Debug, Default)]
pub struct InMemoryDeviceRegistry {
    devices: HashMap<String, DeviceRegistration>,
}

impl InMemoryDeviceRegistry {
    pub fn get(&self, device_ref: &str) -> Option<&DeviceRegistration> {
        self.devices.get(device_ref)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl DeviceRegistry for InMemoryDeviceRegistry {
    fn get_or_create(&mut self, registration: DeviceRegistration) {
        self.devices
            .insert(registration.identifier.1.clone(), registration);
    }
}

/// How [`Integration::setup_entry`] placed an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupOutcome {
    /// Loaded under its own entry id.
    Loaded(String),
    /// The account already had an entry; that entry was updated and
    /// reloaded under its existing id.
    Reconfigured(String),
}

impl SetupOutcome {
    pub fn entry_id(&self) -> &str {
        match self {
            SetupOutcome::Loaded(id) | SetupOutcome::Reconfigured(id) => id,
        }
    }
}

struct LoadedEntry {
    entry: ConfigEntry,
    coordinator: Arc<UsageCoordinator>,
    sensors: Vec<Arc<dyn Sensor>>,
    poll_task: PollTask,
    publisher_task: JoinHandle<()>,
}

impl LoadedEntry {
    fn shutdown(self) {
        self.poll_task.shutdown();
        self.publisher_task.abort();
    }
}

/// Owns every loaded config entry and the tasks that keep it fresh.
pub struct Integration<R: DeviceRegistry> {
    client: EcobullesClient,
    registry: R,
    publisher: Arc<dyn EntityPublisher>,
    entries: HashMap<String, LoadedEntry>,
}

impl<R: DeviceRegistry> Integration<R> {
    pub fn new(client: EcobullesClient, registry: R, publisher: Arc<dyn EntityPublisher>) -> Self {
        Self {
            client,
            registry,
            publisher,
            entries: HashMap::new(),
        }
    }

    /// Registers the device, fetches a first snapshot, then starts polling.
    ///
    /// An account (`unique_id`) has at most one entry: an entry for an
    /// account that is already loaded replaces it under the existing entry
    /// id. Nothing is loaded if the first fetch fails.
    pub async fn setup_entry(
        &mut self,
        mut entry: ConfigEntry,
    ) -> Result<SetupOutcome, EcobullesError> {
        let existing = self
            .entry_id_for_account(&entry.unique_id)
            .filter(|id| *id != entry.entry_id)
            .map(str::to_string);
        if let Some(existing_id) = &existing {
            info!(
                "Account {} already configured as {}, updating it instead of adding {}",
                entry.unique_id, existing_id, entry.entry_id
            );
            entry.entry_id = existing_id.clone();
        }

        if self.unload_entry(&entry.entry_id) {
            info!("Replacing already loaded entry {}", entry.entry_id);
        }

        self.registry
            .get_or_create(DeviceRegistration::for_entry(&entry));

        let device_ref = entry.device.device_ref.clone();
        let coordinator = Arc::new(usage_coordinator(self.client.clone(), &device_ref));
        if let Err(e) = coordinator.refresh_now().await {
            warn!("Setup of {} not ready: {}", entry.title, e);
            return Err(e);
        }

        let sensors: Vec<Arc<dyn Sensor>> = vec![
            Arc::new(WaterUsageSensor::new(coordinator.clone(), device_ref.clone())),
            Arc::new(Co2UsageSensor::new(
                coordinator.clone(),
                device_ref,
                entry.credentials.co2_bottle_weight_kg,
            )),
        ];
        let publisher_task = spawn_sensor_publisher(
            coordinator.subscribe(),
            sensors.clone(),
            self.publisher.clone(),
        );
        let poll_task = coordinator.clone().spawn();

        info!("Loaded entry {} ({})", entry.entry_id, entry.title);
        let entry_id = entry.entry_id.clone();
        self.entries.insert(
            entry_id.clone(),
            LoadedEntry {
                entry,
                coordinator,
                sensors,
                poll_task,
                publisher_task,
            },
        );
        Ok(match existing {
            Some(_) => SetupOutcome::Reconfigured(entry_id),
            None => SetupOutcome::Loaded(entry_id),
        })
    }

    /// Returns whether the entry was loaded.
    pub fn unload_entry(&mut self, entry_id: &str) -> bool {
        match self.entries.remove(entry_id) {
            Some(loaded) => {
                info!("Unloading entry {}", entry_id);
                loaded.shutdown();
                true
            }
            None => false,
        }
    }

    /// Applies an updated entry, e.g. after the options flow.
    pub async fn reload_entry(
        &mut self,
        entry: ConfigEntry,
    ) -> Result<SetupOutcome, EcobullesError> {
        self.unload_entry(&entry.entry_id);
        self.setup_entry(entry).await
    }

    pub fn entry(&self, entry_id: &str) -> Option<&ConfigEntry> {
        self.entries.get(entry_id).map(|loaded| &loaded.entry)
    }

    pub fn coordinator(&self, entry_id: &str) -> Option<Arc<UsageCoordinator>> {
        self.entries
            .get(entry_id)
            .map(|loaded| loaded.coordinator.clone())
    }

    pub fn sensors(&self, entry_id: &str) -> Option<&[Arc<dyn Sensor>]> {
        self.entries
            .get(entry_id)
            .map(|loaded| loaded.sensors.as_slice())
    }

    /// Id of the loaded entry for an account, if any.
    pub fn entry_id_for_account(&self, unique_id: &str) -> Option<&str> {
        self.entries
            .values()
            .find(|loaded| loaded.entry.unique_id == unique_id)
            .map(|loaded| loaded.entry.entry_id.as_str())
    }

    pub fn entry_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Unloads every entry.
    pub fn shutdown(&mut self) {
        for (entry_id, loaded) in self.entries.drain() {
            info!("Unloading entry {}", entry_id);
            loaded.shutdown();
        }
    }
}
