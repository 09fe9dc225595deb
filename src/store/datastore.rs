//! Datastore client.
//!
//! The datastore is an external key-value service fronted by HTTP. Documents
//! are addressed by `(namespace, id)`; change notifications for a namespace
//! arrive out-of-band (MQTT) and are handed to the stores as
//! [DatastoreEvent] values by the messaging adapter.

use std::fmt;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// Default timeout for datastore reads and writes.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Delay between retries while the datastore is starting up.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);
/// Read attempts before giving up.
pub const RETRY_COUNT: usize = 5;

/// One datastore document
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct DatastoreValue {
    pub id: String,
    pub namespace: String,
    /// Document body, shape depends on the document kind
    #[serde(flatten)]
    pub content: Map<String, Value>,
}

impl DatastoreValue {
    /// Creates a document with an empty body.
    pub fn new<S1, S2>(namespace: S1, id: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            id: id.into(),
            namespace: namespace.into(),
            content: Map::new(),
        }
    }
}

impl fmt::Display for DatastoreValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.id)
    }
}

/// Change notification payload for a datastore namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DatastoreEvent {
    #[serde(default)]
    pub changed: Vec<DatastoreValue>,
    #[serde(default)]
    pub deleted: Vec<String>,
}

#[derive(Serialize)]
struct SingleQuery<'a> {
    id: &'a str,
    namespace: &'a str,
}

#[derive(Serialize)]
struct MultiQuery<'a> {
    namespace: &'a str,
    ids: &'a [&'a str],
}

#[derive(Deserialize)]
struct SingleValueBox {
    value: Option<DatastoreValue>,
}

#[derive(Deserialize)]
struct MultiValueBox {
    values: Vec<DatastoreValue>,
}

#[derive(Serialize)]
struct SingleValueWrite<'a> {
    value: &'a DatastoreValue,
}

/// Storage backend seam.
///
/// The production implementation is [HttpDatastore]; tests use [MemDatastore].
pub trait Datastore: Send + Sync {
    /// Reads a single document, `None` when absent.
    fn get(&self, namespace: &str, id: &str) -> Result<Option<DatastoreValue>>;

    /// Reads multiple documents; absent ids are skipped.
    fn mget(&self, namespace: &str, ids: &[&str]) -> Result<Vec<DatastoreValue>>;

    /// Writes a single document.
    fn set(&self, value: &DatastoreValue) -> Result<()>;
}

/// Blocking HTTP client for the datastore service.
pub struct HttpDatastore {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpDatastore {
    /// Creates a client against the configured base url.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn post<Q, B>(&self, path: &str, query: &Q) -> Result<B>
    where
        Q: Serialize,
        B: for<'de> Deserialize<'de>,
    {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(query)
            .send()?
            .error_for_status()?;
        Ok(resp.json()?)
    }

    /// Retries a read while the datastore is starting up.
    fn retry<T>(&self, describe: &str, f: impl Fn() -> Result<T>) -> Result<T> {
        let mut last = None;

        for attempt in 0..RETRY_COUNT {
            if attempt > 0 {
                thread::sleep(RETRY_INTERVAL);
            }
            match f() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    log::warn!("datastore {describe} failed (attempt {}): {err}", attempt + 1);
                    last = Some(err);
                }
            }
        }

        Err(last.unwrap_or_else(|| Error::failure("datastore retry without attempts")))
    }
}

impl Datastore for HttpDatastore {
    fn get(&self, namespace: &str, id: &str) -> Result<Option<DatastoreValue>> {
        let query = SingleQuery { id, namespace };
        let boxed: SingleValueBox = self.retry("get", || self.post("/get", &query))?;
        Ok(boxed.value)
    }

    fn mget(&self, namespace: &str, ids: &[&str]) -> Result<Vec<DatastoreValue>> {
        let query = MultiQuery { namespace, ids };
        let boxed: MultiValueBox = self.retry("mget", || self.post("/mget", &query))?;
        Ok(boxed.values)
    }

    fn set(&self, value: &DatastoreValue) -> Result<()> {
        let body = SingleValueWrite { value };
        let _: serde_json::Value = self.post("/set", &body)?;
        Ok(())
    }
}

/// In-memory datastore, used as a test double.
#[derive(Default)]
pub struct MemDatastore {
    docs: Mutex<Vec<DatastoreValue>>,
}

impl MemDatastore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the number of stored documents.
    pub fn len(&self) -> usize {
        self.docs.lock().expect("datastore lock poisoned").len()
    }

    /// Gets whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Datastore for MemDatastore {
    fn get(&self, namespace: &str, id: &str) -> Result<Option<DatastoreValue>> {
        let docs = self.docs.lock().expect("datastore lock poisoned");
        Ok(docs
            .iter()
            .find(|doc| doc.namespace == namespace && doc.id == id)
            .cloned())
    }

    fn mget(&self, namespace: &str, ids: &[&str]) -> Result<Vec<DatastoreValue>> {
        let docs = self.docs.lock().expect("datastore lock poisoned");
        Ok(docs
            .iter()
            .filter(|doc| doc.namespace == namespace && ids.contains(&doc.id.as_str()))
            .cloned()
            .collect())
    }

    fn set(&self, value: &DatastoreValue) -> Result<()> {
        let mut docs = self.docs.lock().expect("datastore lock poisoned");
        match docs
            .iter_mut()
            .find(|doc| doc.namespace == value.namespace && doc.id == value.id)
        {
            Some(doc) => *doc = value.clone(),
            None => docs.push(value.clone()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_datastore() -> Result<()> {
        let store = MemDatastore::new();
        assert!(store.is_empty());
        assert_eq!(store.get("ns", "doc")?, None);

        let mut value = DatastoreValue::new("ns", "doc");
        value.content.insert("enabled".into(), Value::Bool(true));
        store.set(&value)?;

        assert_eq!(store.get("ns", "doc")?, Some(value.clone()));
        assert_eq!(store.mget("ns", &["doc", "other"])?.len(), 1);

        value.content.insert("enabled".into(), Value::Bool(false));
        store.set(&value)?;
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get("ns", "doc")?.unwrap().content["enabled"],
            Value::Bool(false)
        );

        Ok(())
    }

    #[test]
    fn test_event_payload_shape() {
        let event: DatastoreEvent = serde_json::from_str(
            r#"{"changed": [{"id": "units", "namespace": "brewblox-global", "temperature": "degF"}]}"#,
        )
        .unwrap();

        assert_eq!(event.changed.len(), 1);
        assert_eq!(event.changed[0].id, "units");
        assert_eq!(event.changed[0].content["temperature"], "degF");
    }
}
