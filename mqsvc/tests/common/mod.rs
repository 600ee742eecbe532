//! Test utilities and helpers for mqsvc integration tests
//!
//! [`RecordingPlugin`] wraps the in-memory broker and records what the
//! runtime asks of its drivers, so tests can assert on consumer creation,
//! pausing and disposal without a real broker.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use mqsvc::config::ConnectionConfig;
use mqsvc::message::ReturnedMessage;
use mqsvc::plugin::{ChannelDriver, ConnectionDriver, ConsumerDriver, ConsumerSpec, Delivery};
use mqsvc::{MemoryPlugin, MessageProperties, MqPlugin, MqPublisherAddress, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

static NEXT_BROKER: AtomicUsize = AtomicUsize::new(0);

/// A `memory://` URL no other test uses.
pub fn broker_url(test_name: &str) -> String {
    format!("memory://{}", broker_name(test_name))
}

pub fn broker_name(test_name: &str) -> String {
    init_tracing();
    let n = NEXT_BROKER.fetch_add(1, Ordering::Relaxed);
    format!("{test_name}-{}-{n}", std::process::id())
}

/// Route runtime logs to the test writer; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds; panics after two seconds.
pub async fn wait_until<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Driver calls seen by a [`RecordingPlugin`].
#[derive(Default)]
pub struct Recorder {
    pub consumer_specs: Mutex<Vec<ConsumerSpec>>,
    pub pause_calls: Mutex<Vec<bool>>,
    pub consumer_cancels: AtomicUsize,
    pub channel_closes: AtomicUsize,
    pub connection_closes: AtomicUsize,
    pub publishes: AtomicUsize,
    /// Teardown calls in the order they happened.
    pub events: Mutex<Vec<&'static str>>,
    /// Extra time each consumer cancel takes.
    pub cancel_delay: Mutex<Option<Duration>>,
}

impl Recorder {
    pub fn consumer_specs(&self) -> Vec<ConsumerSpec> {
        self.consumer_specs.lock().clone()
    }

    pub fn pause_calls(&self) -> Vec<bool> {
        self.pause_calls.lock().clone()
    }

    pub fn consumer_cancels(&self) -> usize {
        self.consumer_cancels.load(Ordering::SeqCst)
    }

    pub fn channel_closes(&self) -> usize {
        self.channel_closes.load(Ordering::SeqCst)
    }

    pub fn connection_closes(&self) -> usize {
        self.connection_closes.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().clone()
    }

    fn event(&self, event: &'static str) {
        self.events.lock().push(event);
    }
}

/// `recording://{broker}`: the in-memory broker with every call recorded.
///
/// An offline plugin records consumer creation without declaring anything,
/// and its consumers never deliver.
#[derive(Default)]
pub struct RecordingPlugin {
    pub recorder: Arc<Recorder>,
    offline: bool,
}

impl RecordingPlugin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn offline() -> Arc<Self> {
        Arc::new(Self {
            offline: true,
            ..Self::default()
        })
    }

    pub fn config(test_name: &str) -> ConnectionConfig {
        ConnectionConfig::new(format!("recording://{}", broker_name(test_name)))
    }
}

#[async_trait]
impl MqPlugin for RecordingPlugin {
    fn scheme(&self) -> &'static str {
        "recording"
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn ConnectionDriver>> {
        let memory = ConnectionConfig::new(format!("memory://{}", config.host()));
        let inner = MemoryPlugin::new().connect(&memory).await?;
        Ok(Arc::new(RecordingConnection {
            inner,
            recorder: self.recorder.clone(),
            offline: self.offline,
        }))
    }
}

struct RecordingConnection {
    inner: Arc<dyn ConnectionDriver>,
    recorder: Arc<Recorder>,
    offline: bool,
}

#[async_trait]
impl ConnectionDriver for RecordingConnection {
    async fn open_channel(&self) -> Result<Arc<dyn ChannelDriver>> {
        let inner = self.inner.open_channel().await?;
        Ok(Arc::new(RecordingChannel {
            inner,
            recorder: self.recorder.clone(),
            offline: self.offline,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.recorder.connection_closes.fetch_add(1, Ordering::SeqCst);
        self.recorder.event("connection-close");
        self.inner.close().await
    }
}

struct RecordingChannel {
    inner: Arc<dyn ChannelDriver>,
    recorder: Arc<Recorder>,
    offline: bool,
}

#[async_trait]
impl ChannelDriver for RecordingChannel {
    async fn consume(&self, spec: ConsumerSpec) -> Result<Arc<dyn ConsumerDriver>> {
        self.recorder.consumer_specs.lock().push(spec.clone());
        let inner: Arc<dyn ConsumerDriver> = if self.offline {
            Arc::new(IdleConsumer::default())
        } else {
            self.inner.consume(spec).await?
        };
        Ok(Arc::new(RecordingConsumer {
            inner,
            recorder: self.recorder.clone(),
        }))
    }

    async fn publish(
        &self,
        address: &MqPublisherAddress,
        body: Bytes,
        properties: &MessageProperties,
        mandatory: bool,
    ) -> Result<()> {
        self.recorder.publishes.fetch_add(1, Ordering::SeqCst);
        self.inner.publish(address, body, properties, mandatory).await
    }

    fn returned(&self) -> broadcast::Receiver<ReturnedMessage> {
        self.inner.returned()
    }

    fn can_pause(&self) -> bool {
        self.inner.can_pause()
    }

    fn is_paused(&self) -> bool {
        self.inner.is_paused()
    }

    fn set_paused(&self, paused: bool) -> Result<()> {
        self.recorder.pause_calls.lock().push(paused);
        self.inner.set_paused(paused)
    }

    async fn close(&self) -> Result<()> {
        self.recorder.channel_closes.fetch_add(1, Ordering::SeqCst);
        self.recorder.event("channel-close");
        self.inner.close().await
    }
}

struct RecordingConsumer {
    inner: Arc<dyn ConsumerDriver>,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl ConsumerDriver for RecordingConsumer {
    async fn next_delivery(&self) -> Option<Delivery> {
        self.inner.next_delivery().await
    }

    fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.inner.ack(delivery_tag)
    }

    async fn cancel(&self) -> Result<()> {
        self.recorder.consumer_cancels.fetch_add(1, Ordering::SeqCst);
        self.recorder.event("consumer-cancel-start");
        let delay = *self.recorder.cancel_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let canceled = self.inner.cancel().await;
        self.recorder.event("consumer-cancel-done");
        canceled
    }
}

/// Consumer that waits for cancellation and never delivers.
#[derive(Default)]
struct IdleConsumer {
    canceled: Notify,
    done: AtomicBool,
}

#[async_trait]
impl ConsumerDriver for IdleConsumer {
    async fn next_delivery(&self) -> Option<Delivery> {
        while !self.done.load(Ordering::SeqCst) {
            let canceled = self.canceled.notified();
            if self.done.load(Ordering::SeqCst) {
                break;
            }
            canceled.await;
        }
        None
    }

    fn ack(&self, _delivery_tag: u64) -> Result<()> {
        Ok(())
    }

    async fn cancel(&self) -> Result<()> {
        self.done.store(true, Ordering::SeqCst);
        self.canceled.notify_waiters();
        Ok(())
    }
}
