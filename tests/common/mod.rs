//! In-memory backend and engine wiring shared by the integration tests.

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use stalewise::entities::{EVENTS_LIST, EVENT_DETAIL, RSVP_STATUS};
use stalewise::{
    CacheEngine, CacheKey, EngineConfig, Error, ManualClock, MemorySecureStore, Namespace, Result,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSummary {
    pub id: u32,
    pub attendees: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDetail {
    pub id: u32,
    pub title: String,
    pub attendees: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rsvp {
    pub event_id: u32,
    pub going: bool,
}

/// Fake remote API. Counts calls per namespace and can be taken offline.
pub struct Backend {
    events: Mutex<BTreeMap<u32, EventDetail>>,
    rsvps: Mutex<HashMap<u32, bool>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    offline: AtomicBool,
    latency: Duration,
}

impl Backend {
    pub fn new(latency: Duration) -> Self {
        let events = [(42, "Rust meetup", 3), (7, "Book club", 10)]
            .into_iter()
            .map(|(id, title, attendees)| {
                (
                    id,
                    EventDetail {
                        id,
                        title: title.to_string(),
                        attendees,
                    },
                )
            })
            .collect();
        Self {
            events: Mutex::new(events),
            rsvps: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
            latency,
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self, namespace: &str) -> usize {
        self.calls.lock().unwrap().get(namespace).copied().unwrap_or(0)
    }

    pub fn attendees(&self, id: u32) -> u32 {
        self.events.lock().unwrap()[&id].attendees
    }

    async fn round_trip(&self, namespace: &'static str) -> Result<()> {
        *self.calls.lock().unwrap().entry(namespace).or_insert(0) += 1;
        tokio::time::sleep(self.latency).await;
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::transient("backend unreachable"));
        }
        Ok(())
    }

    fn event_id(key: &CacheKey) -> Result<u32> {
        key.identity()
            .parse()
            .map_err(|_| Error::not_found(key.as_str()))
    }

    pub async fn fetch_list(&self, _key: &CacheKey) -> Result<Vec<EventSummary>> {
        self.round_trip(EVENTS_LIST).await?;
        Ok(self
            .events
            .lock()
            .unwrap()
            .values()
            .map(|e| EventSummary {
                id: e.id,
                attendees: e.attendees,
            })
            .collect())
    }

    pub async fn fetch_detail(&self, key: &CacheKey) -> Result<EventDetail> {
        self.round_trip(EVENT_DETAIL).await?;
        let id = Self::event_id(key)?;
        self.events
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(key.as_str()))
    }

    pub async fn fetch_rsvp(&self, key: &CacheKey) -> Result<Rsvp> {
        self.round_trip(RSVP_STATUS).await?;
        let event_id = Self::event_id(key)?;
        let going = self.rsvps.lock().unwrap().get(&event_id).copied().unwrap_or(false);
        Ok(Rsvp { event_id, going })
    }

    pub async fn set_rsvp(&self, event_id: u32, going: bool) -> Result<Rsvp> {
        self.round_trip("mutation").await?;
        let was_going = self
            .rsvps
            .lock()
            .unwrap()
            .insert(event_id, going)
            .unwrap_or(false);
        let mut events = self.events.lock().unwrap();
        let event = events
            .get_mut(&event_id)
            .ok_or_else(|| Error::not_found(format!("event:{}", event_id)))?;
        match (was_going, going) {
            (false, true) => event.attendees += 1,
            (true, false) => event.attendees -= 1,
            _ => {}
        }
        Ok(Rsvp { event_id, going })
    }
}

pub struct App {
    pub engine: CacheEngine,
    pub clock: ManualClock,
    pub backend: Arc<Backend>,
    pub secrets: Arc<MemorySecureStore>,
    pub list: Namespace<Vec<EventSummary>>,
    pub detail: Namespace<EventDetail>,
    pub rsvp: Namespace<Rsvp>,
}

pub fn app() -> App {
    app_with_latency(Duration::from_millis(20))
}

pub fn app_with_latency(latency: Duration) -> App {
    init_tracing();
    let clock = ManualClock::default();
    let backend = Arc::new(Backend::new(latency));
    let secrets = Arc::new(MemorySecureStore::with_secret("auth-token", "token-1"));

    let engine = CacheEngine::builder()
        .with_config(EngineConfig::standard())
        .with_clock(Arc::new(clock.clone()))
        .with_secure_store(secrets.clone())
        .build()
        .unwrap();

    let b = Arc::clone(&backend);
    let list = engine
        .register::<Vec<EventSummary>, _>(EVENTS_LIST, move |key: CacheKey| {
            let b = Arc::clone(&b);
            async move { b.fetch_list(&key).await }
        })
        .unwrap();
    let b = Arc::clone(&backend);
    let detail = engine
        .register::<EventDetail, _>(EVENT_DETAIL, move |key: CacheKey| {
            let b = Arc::clone(&b);
            async move { b.fetch_detail(&key).await }
        })
        .unwrap();
    let b = Arc::clone(&backend);
    let rsvp = engine
        .register::<Rsvp, _>(RSVP_STATUS, move |key: CacheKey| {
            let b = Arc::clone(&b);
            async move { b.fetch_rsvp(&key).await }
        })
        .unwrap();

    App {
        engine,
        clock,
        backend,
        secrets,
        list,
        detail,
        rsvp,
    }
}

/// Wait until no producer call is outstanding and spawned watchers ran.
pub async fn settle(engine: &CacheEngine) {
    for _ in 0..200 {
        if engine.in_flight() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
}
