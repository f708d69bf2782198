//! ==============================================================================
//! station.rs - shared station handle
//! ==============================================================================
//!
//! holds the state shared between:
//!     - the sampling loop (takes samples, persists them)
//!     - the web server (asks for a fresh sample, reads history)
//!
//! only one sampling cycle runs at a time. while one is in progress, every
//! other request is answered from the cache instead of queueing up on the
//! hardware. that decision is an explicit `in_progress` flag, the sampler's
//! own mutex is never contended.
//!
//! a cycle runs in its own task. a caller that goes away (an http client
//! disconnecting) only detaches from it, so a conversion that was already
//! triggered is still read out and cached.
//!
//! ==============================================================================

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{SensorSample, WeatherSample};
use crate::hal::I2cBus;
use crate::sampler::Sampler;
use crate::store::Store;

#[derive(Default)]
struct CacheState {
    last_sample: Option<SensorSample>,
    last_timestamp: Option<DateTime<Utc>>,
    in_progress: bool,
    last_weather: Option<WeatherSample>,
}

/// Outcome of [`Station::sample_now`].
#[derive(Debug, Clone, PartialEq)]
pub enum Sampled {
    Fresh(SensorSample),
    /// Another cycle was running. `None` until the first cycle finished.
    Cached(Option<SensorSample>),
}

impl Sampled {
    pub fn into_sample(self) -> Option<SensorSample> {
        match self {
            Sampled::Fresh(sample) => Some(sample),
            Sampled::Cached(sample) => sample,
        }
    }
}

struct Inner<B> {
    cache: Mutex<CacheState>,
    sampler: tokio::sync::Mutex<Sampler<B>>,
    store: Option<Store>,
    cancel: CancellationToken,
    /// Result of every finished cycle, `None` for one that died.
    finished: watch::Sender<Option<SensorSample>>,
}

pub struct Station<B> {
    inner: Arc<Inner<B>>,
}

impl<B> Clone for Station<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

enum Cycle {
    Started(JoinHandle<SensorSample>),
    Running {
        cached: Option<SensorSample>,
        finished: watch::Receiver<Option<SensorSample>>,
    },
}

/// Owned by the cycle task. Clears `in_progress` and wakes the waiters if the
/// task ends without publishing a sample (panic, runtime shutdown).
struct CycleGuard<B>(Arc<Inner<B>>);

impl<B> Drop for CycleGuard<B> {
    fn drop(&mut self) {
        let mut cache = lock(&self.0.cache);
        if cache.in_progress {
            cache.in_progress = false;
            self.0.finished.send_replace(None);
        }
    }
}

fn lock(cache: &Mutex<CacheState>) -> MutexGuard<'_, CacheState> {
    cache.lock().unwrap_or_else(|e| e.into_inner())
}

async fn run_cycle<B: I2cBus + 'static>(guard: CycleGuard<B>) -> SensorSample {
    let inner = &guard.0;
    let sample = inner.sampler.lock().await.sample(&inner.cancel).await;

    // publishing and clearing the flag happen under one lock, so a waiter
    // that saw the flag set always sees this send
    let mut cache = lock(&inner.cache);
    cache.last_sample = Some(sample.clone());
    cache.last_timestamp = Some(sample.time);
    cache.in_progress = false;
    inner.finished.send_replace(Some(sample.clone()));
    sample
}

impl<B: I2cBus + 'static> Station<B> {
    pub fn new(sampler: Sampler<B>, store: Option<Store>, cancel: CancellationToken) -> Self {
        let (finished, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                cache: Mutex::new(CacheState::default()),
                sampler: tokio::sync::Mutex::new(sampler),
                store,
                cancel,
                finished,
            }),
        }
    }

    fn begin(&self) -> Cycle {
        let mut cache = lock(&self.inner.cache);
        if cache.in_progress {
            return Cycle::Running {
                cached: cache.last_sample.clone(),
                finished: self.inner.finished.subscribe(),
            };
        }
        cache.in_progress = true;
        let guard = CycleGuard(self.inner.clone());
        Cycle::Started(tokio::spawn(run_cycle(guard)))
    }

    async fn join(task: JoinHandle<SensorSample>) -> Option<SensorSample> {
        match task.await {
            Ok(sample) => Some(sample),
            Err(e) => {
                warn!("[STATION] ⚠ Sampling cycle failed: {}", e);
                None
            }
        }
    }

    pub async fn sample_now(&self) -> Sampled {
        match self.begin() {
            Cycle::Started(task) => match Self::join(task).await {
                Some(sample) => Sampled::Fresh(sample),
                None => Sampled::Cached(self.last_sample()),
            },
            Cycle::Running { cached, .. } => {
                debug!("sampling already in progress, answering from cache");
                Sampled::Cached(cached)
            }
        }
    }

    /// Samples and persists the result. If a cycle is already running this
    /// waits for it and persists its sample instead of starting another.
    ///
    /// Meant for the single scheduled caller: two callers waiting on the same
    /// cycle would both store it.
    pub async fn sample_and_store(&self) -> Option<SensorSample> {
        let sample = match self.begin() {
            Cycle::Started(task) => Self::join(task).await,
            Cycle::Running { mut finished, .. } => {
                debug!("sampling already in progress, waiting for it");
                match finished.changed().await {
                    Ok(()) => finished.borrow_and_update().clone(),
                    Err(_) => None,
                }
            }
        }?;

        if let Some(store) = &self.inner.store {
            if let Err(e) = store.insert_sensor(&sample) {
                warn!("[STORE] ⚠ Failed to store sensor sample: {}", e);
            }
        }
        Some(sample)
    }

    pub fn record_weather(&self, sample: WeatherSample) {
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.insert_weather(&sample) {
                warn!("[STORE] ⚠ Failed to store weather sample: {}", e);
            }
        }
        lock(&self.inner.cache).last_weather = Some(sample);
    }

    pub fn last_sample(&self) -> Option<SensorSample> {
        lock(&self.inner.cache).last_sample.clone()
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        lock(&self.inner.cache).last_timestamp
    }

    pub fn last_weather(&self) -> Option<WeatherSample> {
        lock(&self.inner.cache).last_weather.clone()
    }

    pub fn is_sampling(&self) -> bool {
        lock(&self.inner.cache).in_progress
    }

    pub fn store(&self) -> Option<&Store> {
        self.inner.store.as_ref()
    }
}
