//! Lookup tests: two hosts on one broker resolving each other's addresses

mod common;

use bytes::Bytes;
use common::{broker_name, wait_until};
use mqsvc::memory::MemoryBroker;
use mqsvc::{
    micro_service, Disposable, LookupOutcome, MessageContext, MessageProperties, MicroServiceHost,
    MqAddress, MqConnection, Result, RuntimeConfig,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const PREFIX: &str = "topic://medseek-util/medseek-lookup.1.";

#[derive(Default)]
struct Invoices {
    received: Mutex<Vec<String>>,
}

#[micro_service(contract = "Invoices")]
impl Invoices {
    #[binding(address = "topic://billing-eu/invoice.create/invoices-eu", one_way)]
    fn create(&self, ctx: &MessageContext, _body: Bytes) -> Result<()> {
        self.received.lock().push(format!("eu:{}", ctx.routing_key()));
        Ok(())
    }

    #[binding(address = "topic://billing/invoice.legacy/invoices-legacy", one_way)]
    fn legacy(&self, ctx: &MessageContext, _body: Bytes) -> Result<()> {
        self.received.lock().push(format!("legacy:{}", ctx.routing_key()));
        Ok(())
    }
}

async fn host(broker: &str) -> MicroServiceHost {
    let config = RuntimeConfig::from_toml_str(&format!(
        "[connection]\nurl = \"memory://{broker}\"\n\n[lookup]\ntimeout_ms = 2000\n"
    ))
    .unwrap();
    MicroServiceHost::new(config).await.unwrap()
}

/// A queue that swallows every lookup query; nobody drains it.
async fn query_probe(broker: &str) -> MqConnection {
    let connection = MqConnection::open_url(&format!("memory://{broker}"))
        .await
        .unwrap();
    let channel = connection.create_channel().await.unwrap();
    channel
        .create_consumer(&MqAddress::new(format!("{PREFIX}query.#/query-probe")), false, true)
        .await
        .unwrap();
    connection
}

fn logical() -> MqAddress {
    MqAddress::from("topic://billing/invoice.create")
}

fn physical() -> MqAddress {
    MqAddress::from("topic://billing-eu/invoice.create")
}

#[tokio::test]
async fn test_resolve_queries_the_advertiser_once() {
    let broker = broker_name("lookup-once");
    let server = host(&broker).await;
    server.start().await.unwrap();
    server
        .lookup()
        .unwrap()
        .advertise(&logical(), &physical())
        .await
        .unwrap();

    let probe = query_probe(&broker).await;
    let client = host(&broker).await;
    client.start().await.unwrap();
    let lookup = client.lookup().unwrap();
    assert_eq!(lookup.cached(&logical()), None);

    assert_eq!(
        lookup.resolve(&logical()).await.unwrap(),
        LookupOutcome::Resolved(physical())
    );
    assert_eq!(
        lookup.resolve(&logical()).await.unwrap(),
        LookupOutcome::Resolved(physical())
    );
    assert_eq!(
        MemoryBroker::named(&broker).queue_depth("query-probe"),
        Some(1)
    );
    assert_eq!(lookup.pending_count(), 0);

    client.dispose().await;
    server.dispose().await;
    probe.dispose().await;
}

#[tokio::test]
async fn test_unadvertised_address_is_unresolved_and_cached() {
    let broker = broker_name("lookup-unadvertised");
    let client = host(&broker).await;
    client.start().await.unwrap();
    let lookup = client.lookup().unwrap();
    let address = MqAddress::from("topic://billing/nobody");

    assert_eq!(
        lookup.resolve(&address).await.unwrap(),
        LookupOutcome::Unresolved
    );
    assert_eq!(lookup.cached(&address), Some(LookupOutcome::Unresolved));
    assert_eq!(lookup.pending_count(), 0);

    client.dispose().await;
}

#[tokio::test]
async fn test_updates_reach_running_lookups() {
    let broker = broker_name("lookup-updates");
    let server = host(&broker).await;
    let client = host(&broker).await;
    server.start().await.unwrap();
    client.start().await.unwrap();
    let lookup = client.lookup().unwrap();

    let advertiser = server.lookup().unwrap();
    advertiser.advertise(&logical(), &physical()).await.unwrap();
    wait_until("update applied", || {
        lookup.cached(&logical()) == Some(LookupOutcome::Resolved(physical()))
    })
    .await;

    advertiser.withdraw(&logical()).await.unwrap();
    wait_until("withdrawal applied", || {
        lookup.cached(&logical()) == Some(LookupOutcome::Unresolved)
    })
    .await;

    client.dispose().await;
    server.dispose().await;
}

#[tokio::test]
async fn test_unanswered_query_times_out_without_caching() {
    let broker = broker_name("lookup-timeout");
    let probe = query_probe(&broker).await;
    let client = host(&broker).await;
    client.start().await.unwrap();
    let lookup = client.lookup().unwrap();

    let outcome = lookup
        .resolve_with_timeout(&logical(), Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(outcome, LookupOutcome::TimedOut);
    assert_eq!(lookup.cached(&logical()), None);
    assert_eq!(lookup.pending_count(), 0);

    client.dispose().await;
    probe.dispose().await;
}

#[tokio::test]
async fn test_host_dispose_cancels_pending_resolve() {
    let broker = broker_name("lookup-cancel");
    let probe = query_probe(&broker).await;
    let client = host(&broker).await;
    client.start().await.unwrap();

    let lookup = client.lookup().unwrap().clone();
    let resolving = tokio::spawn(async move {
        lookup
            .resolve_with_timeout(&logical(), Duration::from_secs(30))
            .await
    });
    let memory = MemoryBroker::named(&broker);
    wait_until("query published", || memory.queue_depth("query-probe") == Some(1)).await;

    client.dispose().await;
    let outcome = tokio::time::timeout(Duration::from_secs(2), resolving)
        .await
        .expect("resolve finishes on dispose")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, LookupOutcome::Canceled);

    probe.dispose().await;
}

#[tokio::test]
async fn test_send_resolves_or_falls_back() {
    let broker = broker_name("lookup-send");
    let invoices = Arc::new(Invoices::default());
    let server = host(&broker).await;
    server.locator().register_instance(invoices.clone()).unwrap();
    server.start().await.unwrap();
    server
        .lookup()
        .unwrap()
        .advertise(&logical(), &physical())
        .await
        .unwrap();

    let client = host(&broker).await;
    client.start().await.unwrap();
    let dispatcher = client.dispatcher();

    // Advertised: delivered to the physical address.
    dispatcher
        .send(&logical(), Bytes::from_static(b"1"), MessageProperties::new(), true)
        .await
        .unwrap();
    wait_until("resolved delivery", || invoices.received.lock().len() == 1).await;

    // Unadvertised: the broker returns the query and the send goes out as is.
    let legacy = MqAddress::from("topic://billing/invoice.legacy");
    dispatcher
        .send(&legacy, Bytes::from_static(b"2"), MessageProperties::new(), true)
        .await
        .unwrap();
    wait_until("fallback delivery", || invoices.received.lock().len() == 2).await;
    assert_eq!(
        client.lookup().unwrap().cached(&legacy),
        Some(LookupOutcome::Unresolved)
    );

    assert_eq!(
        *invoices.received.lock(),
        ["eu:invoice.create", "legacy:invoice.legacy"]
    );

    client.dispose().await;
    server.dispose().await;
}
