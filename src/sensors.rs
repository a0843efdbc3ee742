use crate::ecobulles::UsageSnapshot;
use crate::poll_coordinator::PollEvent;
use crate::usage_coordinator::UsageCoordinator;
use serde_derive::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub const DOMAIN: &str = "ecobulles";
pub const MANUFACTURER: &str = "Ecobulles";
pub const MODEL: &str = "Ecobulles";

/// What the host needs to render one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorState {
    pub unique_id: String,
    pub name: String,
    pub value: Option<f64>,
    pub unit: String,
    pub device_class: String,
    pub state_class: Option<String>,
    pub icon: Option<String>,
    pub available: bool,
    pub attributes: BTreeMap<String, String>,
    /// `(domain, device ref)` linking the entity to its registered device.
    pub device_identifier: (String, String),
}

/// Receives sensor states for publication by the host.
pub trait EntityPublisher: Send + Sync {
    fn publish(&self, state: &SensorState);
}

/// Read-only view over the usage coordinator's cached snapshot.
pub trait Sensor: Send + Sync {
    fn unique_id(&self) -> String;

    fn state(&self) -> SensorState;
}

pub struct WaterUsageSensor {
    coordinator: Arc<UsageCoordinator>,
    device_ref: String,
}

impl WaterUsageSensor {
    pub fn new(coordinator: Arc<UsageCoordinator>, device_ref: impl Into<String>) -> Self {
        Self {
            coordinator,
            device_ref: device_ref.into(),
        }
    }
}

impl Sensor for WaterUsageSensor {
    fn unique_id(&self) -> String {
        format!("{}_total_water_usage", self.device_ref)
    }

    fn state(&self) -> SensorState {
        let snapshot = self.coordinator.current_snapshot();
        SensorState {
            unique_id: self.unique_id(),
            name: "Water Usage".to_string(),
            value: snapshot.as_ref().map(|s| s.total_water as f64),
            unit: "L".to_string(),
            device_class: "water".to_string(),
            state_class: Some("total_increasing".to_string()),
            icon: None,
            available: available(&self.coordinator),
            attributes: attributes(snapshot.as_deref(), &self.device_ref),
            device_identifier: (DOMAIN.to_string(), self.device_ref.clone()),
        }
    }
}

pub struct Co2UsageSensor {
    coordinator: Arc<UsageCoordinator>,
    device_ref: String,
    bottle_weight_kg: u32,
}

impl Co2UsageSensor {
    pub fn new(
        coordinator: Arc<UsageCoordinator>,
        device_ref: impl Into<String>,
        bottle_weight_kg: u32,
    ) -> Self {
        Self {
            coordinator,
            device_ref: device_ref.into(),
            bottle_weight_kg,
        }
    }
}

impl Sensor for Co2UsageSensor {
    fn unique_id(&self) -> String {
        format!("{}_co2_usage", self.device_ref)
    }

    fn state(&self) -> SensorState {
        let snapshot = self.coordinator.current_snapshot();
        SensorState {
            unique_id: self.unique_id(),
            name: "CO2 Usage".to_string(),
            value: snapshot
                .as_ref()
                .and_then(|s| co2_percentage(s.total_gas, self.bottle_weight_kg)),
            unit: "%".to_string(),
            device_class: "weight".to_string(),
            state_class: None,
            icon: Some("mdi:molecule-co2".to_string()),
            available: available(&self.coordinator),
            attributes: attributes(snapshot.as_deref(), &self.device_ref),
            device_identifier: (DOMAIN.to_string(), self.device_ref.clone()),
        }
    }
}

/// Share of the bottle already injected, rounded to two decimals.
///
/// `None` for an empty bottle weight.
pub fn co2_percentage(total_gas_mg: u64, bottle_weight_kg: u32) -> Option<f64> {
    if bottle_weight_kg == 0 {
        return None;
    }
    let bottle_weight_mg = bottle_weight_kg as f64 * 1_000_000.0;
    let percentage = total_gas_mg as f64 / bottle_weight_mg * 100.0;
    Some((percentage * 100.0).round() / 100.0)
}

fn available(coordinator: &UsageCoordinator) -> bool {
    coordinator.last_update_success() && coordinator.current_snapshot().is_some()
}

fn attributes(snapshot: Option<&UsageSnapshot>, device_ref: &str) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::new();
    attributes.insert("eco_ref".to_string(), device_ref.to_string());
    if let Some(last_updated) = snapshot.and_then(|s| s.last_updated.clone()) {
        attributes.insert("last_updated".to_string(), last_updated);
    }
    attributes
}

/// Publishes every sensor once, then again after each completed poll cycle.
pub fn spawn_sensor_publisher(
    mut events: broadcast::Receiver<PollEvent>,
    sensors: Vec<Arc<dyn Sensor>>,
    publisher: Arc<dyn EntityPublisher>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        publish_all(&sensors, publisher.as_ref());
        loop {
            match events.recv().await {
                Ok(event) => {
                    debug!("Poll event {:?}, republishing sensors", event);
                    publish_all(&sensors, publisher.as_ref());
                }
                // Missed events still mean the snapshot may have moved.
                Err(RecvError::Lagged(_)) => publish_all(&sensors, publisher.as_ref()),
                Err(RecvError::Closed) => break,
            }
        }
        info!("Sensor publisher exiting");
    })
}

fn publish_all(sensors: &[Arc<dyn Sensor>], publisher: &dyn EntityPublisher) {
    for sensor in sensors {
        publisher.publish(&sensor.state());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecobulles::EcobullesClient;
    use crate::usage_coordinator::usage_coordinator;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingPublisher {
        states: Mutex<Vec<SensorState>>,
    }

    impl EntityPublisher for RecordingPublisher {
        fn publish(&self, state: &SensorState) {
            self.states.lock().unwrap().push(state.clone());
        }
    }

    fn usage_body(last_updated: &str) -> String {
        format!(
            r#"{{"data": {{"infoconso": {{
                "graph": [{{"date": "{last_updated}"}}],
                "total_gas": "500000",
                "total_eau": "120"
            }}}}}}"#
        )
    }

    #[test]
    fn test_co2_percentage() {
        assert_eq!(co2_percentage(500_000, 10), Some(5.0));
        assert_eq!(co2_percentage(0, 10), Some(0.0));
        assert_eq!(co2_percentage(1_234_567, 6), Some(20.58));
        assert_eq!(co2_percentage(500_000, 0), None);
    }

    #[tokio::test]
    async fn test_sensors_before_first_snapshot() {
        let coordinator = Arc::new(usage_coordinator(
            EcobullesClient::with_base_url("http://127.0.0.1:9"),
            "ECO-0001",
        ));
        let water = WaterUsageSensor::new(coordinator.clone(), "ECO-0001");
        let co2 = Co2UsageSensor::new(coordinator, "ECO-0001", 10);

        let water_state = water.state();
        assert_eq!(water_state.value, None);
        assert!(!water_state.available);
        assert_eq!(water_state.attributes.get("last_updated"), None);
        assert_eq!(co2.state().value, None);
    }

    #[tokio::test]
    async fn test_sensor_projections() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/getConsoBoiteItemAppFilter.php")
            .with_status(200)
            .with_body(usage_body(&chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()))
            .create_async()
            .await;
        let coordinator = Arc::new(usage_coordinator(
            EcobullesClient::with_base_url(server.url()),
            "ECO-0001",
        ));
        coordinator.refresh_now().await.unwrap();

        let water = WaterUsageSensor::new(coordinator.clone(), "ECO-0001").state();
        assert_eq!(water.unique_id, "ECO-0001_total_water_usage");
        assert_eq!(water.name, "Water Usage");
        assert_eq!(water.value, Some(120.0));
        assert_eq!(water.unit, "L");
        assert_eq!(water.device_class, "water");
        assert_eq!(water.state_class.as_deref(), Some("total_increasing"));
        assert!(water.available);
        assert_eq!(water.attributes["eco_ref"], "ECO-0001");
        assert!(water.attributes.contains_key("last_updated"));
        assert_eq!(
            water.device_identifier,
            ("ecobulles".to_string(), "ECO-0001".to_string())
        );

        let co2 = Co2UsageSensor::new(coordinator, "ECO-0001", 10).state();
        assert_eq!(co2.unique_id, "ECO-0001_co2_usage");
        assert_eq!(co2.value, Some(5.0));
        assert_eq!(co2.unit, "%");
        assert_eq!(co2.icon.as_deref(), Some("mdi:molecule-co2"));
    }

    #[tokio::test]
    async fn test_publisher_marks_unavailable_after_failure() {
        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("POST", "/getConsoBoiteItemAppFilter.php")
            .with_status(200)
            .with_body(usage_body(&chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()))
            .expect(1)
            .create_async()
            .await;
        let coordinator = Arc::new(usage_coordinator(
            EcobullesClient::with_base_url(server.url()),
            "ECO-0001",
        ));
        coordinator.refresh_now().await.unwrap();
        ok.assert_async().await;
        ok.remove_async().await;
        server
            .mock("POST", "/getConsoBoiteItemAppFilter.php")
            .with_status(500)
            .create_async()
            .await;

        let publisher = Arc::new(RecordingPublisher::default());
        let sensors: Vec<Arc<dyn Sensor>> = vec![Arc::new(WaterUsageSensor::new(
            coordinator.clone(),
            "ECO-0001",
        ))];
        let handle =
            spawn_sensor_publisher(coordinator.subscribe(), sensors, publisher.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(coordinator.refresh_now().await.is_err());
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        let states = publisher.states.lock().unwrap();
        assert_eq!(states.len(), 2);
        assert!(states[0].available);
        // The retained value is still reported, flagged unavailable.
        assert!(!states[1].available);
        assert_eq!(states[1].value, Some(120.0));
    }

    #[tokio::test]
    async fn test_publisher_catches_up_after_lagging() {
        let coordinator = Arc::new(usage_coordinator(
            EcobullesClient::with_base_url("http://127.0.0.1:9"),
            "ECO-0001",
        ));
        let publisher = Arc::new(RecordingPublisher::default());
        let sensors: Vec<Arc<dyn Sensor>> =
            vec![Arc::new(WaterUsageSensor::new(coordinator, "ECO-0001"))];

        // Capacity one: three sends before the task runs leave it two behind.
        let (tx, rx) = broadcast::channel(1);
        tx.send(PollEvent::Updated).unwrap();
        tx.send(PollEvent::UpdateFailed("boom".into())).unwrap();
        tx.send(PollEvent::Updated).unwrap();
        drop(tx);

        let handle = spawn_sensor_publisher(rx, sensors, publisher.clone());
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("publisher should exit once the channel closes")
            .unwrap();

        // Initial pass, one for the lag, one for the retained event.
        let states = publisher.states.lock().unwrap();
        assert_eq!(states.len(), 3);
        assert!(states
            .iter()
            .all(|state| state.unique_id == "ECO-0001_total_water_usage"));
    }
}
