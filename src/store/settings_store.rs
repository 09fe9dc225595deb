//! Cached service-scoped and globally-scoped settings.

use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use super::datastore::{Datastore, DatastoreEvent, DatastoreValue};
use crate::units::TempUnit;
use crate::{Result, GLOBAL_NAMESPACE, GLOBAL_TIME_ZONE_ID, GLOBAL_UNITS_ID, SERVICE_NAMESPACE};

type Listener = Box<dyn Fn() + Send + Sync>;

/// Persisted service-scoped settings
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Service-level desire to connect
    pub enabled: bool,
    /// Last used reconnect interval, so restarts resume the backoff
    #[serde(rename = "retryInterval", skip_serializing_if = "Option::is_none")]
    pub retry_interval_secs: Option<f64>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            retry_interval_secs: None,
        }
    }
}

/// Globally shared unit preferences
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct UnitSettings {
    pub temperature: TempUnit,
}

/// Globally shared time zone
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeZoneSettings {
    pub name: String,
    #[serde(rename = "posixValue")]
    pub posix_value: String,
}

impl Default for TimeZoneSettings {
    fn default() -> Self {
        Self {
            name: "Etc/UTC".into(),
            posix_value: "UTC0".into(),
        }
    }
}

/// Copy-on-read cache of the service and global settings documents.
///
/// Settings are fetched once at startup and afterwards mutated only by
/// datastore change notifications or explicit commits. Consumers always get
/// a snapshot; listeners are notified after a change is applied.
pub struct SettingsStore {
    datastore: Arc<dyn Datastore>,
    service_id: String,
    service: RwLock<ServiceSettings>,
    units: RwLock<UnitSettings>,
    timezone: RwLock<TimeZoneSettings>,
    service_listeners: Mutex<Vec<Listener>>,
    global_listeners: Mutex<Vec<Listener>>,
}

impl SettingsStore {
    /// Creates a store for the named service, with default settings.
    pub fn new(datastore: Arc<dyn Datastore>, service_id: &str) -> Self {
        Self {
            datastore,
            service_id: service_id.to_string(),
            service: RwLock::new(ServiceSettings::default()),
            units: RwLock::new(UnitSettings::default()),
            timezone: RwLock::new(TimeZoneSettings::default()),
            service_listeners: Mutex::new(vec![]),
            global_listeners: Mutex::new(vec![]),
        }
    }

    /// Fetches all settings documents from the datastore.
    ///
    /// Absent documents leave the defaults in place.
    pub fn fetch_all(&self) -> Result<()> {
        if let Some(doc) = self.datastore.get(SERVICE_NAMESPACE, &self.service_id)? {
            *self.service.write().expect("settings lock poisoned") = parse_doc(&doc);
        }

        let docs = self
            .datastore
            .mget(GLOBAL_NAMESPACE, &[GLOBAL_UNITS_ID, GLOBAL_TIME_ZONE_ID])?;
        for doc in docs {
            self.apply_global_doc(&doc);
        }

        Ok(())
    }

    fn apply_global_doc(&self, doc: &DatastoreValue) -> bool {
        match doc.id.as_str() {
            GLOBAL_UNITS_ID => {
                let parsed: UnitSettings = parse_doc(doc);
                let mut units = self.units.write().expect("settings lock poisoned");
                if *units != parsed {
                    log::info!("received unit settings: {parsed:?}");
                    *units = parsed;
                    return true;
                }
            }
            GLOBAL_TIME_ZONE_ID => {
                let parsed: TimeZoneSettings = parse_doc(doc);
                let mut timezone = self.timezone.write().expect("settings lock poisoned");
                if *timezone != parsed {
                    log::info!("received time zone settings: {parsed:?}");
                    *timezone = parsed;
                    return true;
                }
            }
            other => log::debug!("ignoring global document '{other}'"),
        }
        false
    }

    /// Gets a snapshot of the service settings.
    pub fn service_settings(&self) -> ServiceSettings {
        self.service.read().expect("settings lock poisoned").clone()
    }

    /// Gets a snapshot of the unit settings.
    pub fn unit_settings(&self) -> UnitSettings {
        self.units.read().expect("settings lock poisoned").clone()
    }

    /// Gets a snapshot of the time zone settings.
    pub fn timezone_settings(&self) -> TimeZoneSettings {
        self.timezone.read().expect("settings lock poisoned").clone()
    }

    /// Gets the user temperature preference.
    pub fn temperature(&self) -> TempUnit {
        self.unit_settings().temperature
    }

    /// Updates and persists the service settings.
    ///
    /// The commit holds no settings lock during the datastore call.
    pub fn commit_service_settings(&self, settings: ServiceSettings) -> Result<()> {
        let mut doc = DatastoreValue::new(SERVICE_NAMESPACE, &self.service_id);
        doc.content = match serde_json::to_value(&settings)? {
            serde_json::Value::Object(map) => map,
            _ => Default::default(),
        };

        self.datastore.set(&doc)?;
        *self.service.write().expect("settings lock poisoned") = settings;
        Ok(())
    }

    /// Registers a callback for service settings changes.
    pub fn add_service_listener(&self, listener: Listener) {
        self.service_listeners
            .lock()
            .expect("listener lock poisoned")
            .push(listener);
    }

    /// Registers a callback for global settings changes.
    pub fn add_global_listener(&self, listener: Listener) {
        self.global_listeners
            .lock()
            .expect("listener lock poisoned")
            .push(listener);
    }

    /// Applies a service namespace change notification.
    pub fn on_service_event(&self, event: &DatastoreEvent) {
        let mut dirty = false;

        for doc in &event.changed {
            if doc.id == self.service_id {
                let parsed: ServiceSettings = parse_doc(doc);
                let mut service = self.service.write().expect("settings lock poisoned");
                if *service != parsed {
                    log::info!("received service settings: {parsed:?}");
                    *service = parsed;
                    dirty = true;
                }
            }
        }

        if dirty {
            for listener in self
                .service_listeners
                .lock()
                .expect("listener lock poisoned")
                .iter()
            {
                listener();
            }
        }
    }

    /// Applies a global namespace change notification.
    pub fn on_global_event(&self, event: &DatastoreEvent) {
        let mut dirty = false;

        for doc in &event.changed {
            dirty |= self.apply_global_doc(doc);
        }

        if dirty {
            for listener in self
                .global_listeners
                .lock()
                .expect("listener lock poisoned")
                .iter()
            {
                listener();
            }
        }
    }
}

/// Parses a document body, falling back to defaults on malformed content.
fn parse_doc<T>(doc: &DatastoreValue) -> T
where
    T: Default + for<'de> Deserialize<'de>,
{
    match serde_json::from_value(serde_json::Value::Object(doc.content.clone())) {
        Ok(parsed) => parsed,
        Err(err) => {
            log::warn!("malformed settings document {doc}: {err}");
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemDatastore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(namespace: &str, id: &str, content: serde_json::Value) -> DatastoreEvent {
        let mut doc = DatastoreValue::new(namespace, id);
        doc.content = match content {
            serde_json::Value::Object(map) => map,
            _ => panic!("content must be an object"),
        };
        DatastoreEvent {
            changed: vec![doc],
            deleted: vec![],
        }
    }

    #[test]
    fn test_defaults_without_documents() {
        let store = SettingsStore::new(Arc::new(MemDatastore::new()), "spark-one");
        store.fetch_all().unwrap();

        assert!(store.service_settings().enabled);
        assert_eq!(store.temperature(), TempUnit::Celsius);
        assert_eq!(store.timezone_settings().posix_value, "UTC0");
    }

    #[test]
    fn test_fetch_all_reads_documents() {
        let datastore = Arc::new(MemDatastore::new());

        let mut doc = DatastoreValue::new(SERVICE_NAMESPACE, "spark-one");
        doc.content.insert("enabled".into(), serde_json::json!(false));
        datastore.set(&doc).unwrap();

        let mut doc = DatastoreValue::new(GLOBAL_NAMESPACE, GLOBAL_UNITS_ID);
        doc.content
            .insert("temperature".into(), serde_json::json!("degF"));
        datastore.set(&doc).unwrap();

        let store = SettingsStore::new(datastore, "spark-one");
        store.fetch_all().unwrap();

        assert!(!store.service_settings().enabled);
        assert_eq!(store.temperature(), TempUnit::Fahrenheit);
    }

    #[test]
    fn test_global_event_notifies_once_per_change() {
        let store = Arc::new(SettingsStore::new(Arc::new(MemDatastore::new()), "spark-one"));
        let calls = Arc::new(AtomicUsize::new(0));

        {
            let calls = Arc::clone(&calls);
            store.add_global_listener(Box::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let evt = event(
            GLOBAL_NAMESPACE,
            GLOBAL_UNITS_ID,
            serde_json::json!({ "temperature": "degF" }),
        );
        store.on_global_event(&evt);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.temperature(), TempUnit::Fahrenheit);

        // Setting the current value again produces no notification
        store.on_global_event(&evt);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_service_event_for_other_service_is_ignored() {
        let store = SettingsStore::new(Arc::new(MemDatastore::new()), "spark-one");

        let evt = event(
            SERVICE_NAMESPACE,
            "spark-two",
            serde_json::json!({ "enabled": false }),
        );
        store.on_service_event(&evt);
        assert!(store.service_settings().enabled);
    }

    #[test]
    fn test_commit_service_settings() {
        let datastore = Arc::new(MemDatastore::new());
        let store = SettingsStore::new(datastore.clone(), "spark-one");

        store
            .commit_service_settings(ServiceSettings {
                enabled: false,
                retry_interval_secs: Some(4.5),
            })
            .unwrap();

        let doc = datastore.get(SERVICE_NAMESPACE, "spark-one").unwrap().unwrap();
        assert_eq!(doc.content["enabled"], serde_json::json!(false));
        assert!(!store.service_settings().enabled);
    }
}
