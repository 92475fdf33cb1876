use mq_flow::*;

/// Accepts every message and never lets go of it, like a queue nobody consumes from.
struct Blackhole;

impl Dispatch for Blackhole {
    async fn dispatch(&self, _: &Destination, _: MessageId, _: Message) -> Result<(), DispatchError> {
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let config = BrokerConfig::default()
        .with_policy(DestinationPolicy::new(DestinationKind::Queue, "TINY_QUEUE", Some(Limits::high_water(1024))))
        .with_close_timeout(std::time::Duration::from_secs(10));

    let broker = Broker::start(config, Blackhole);
    let producer = broker.create_producer("queue://TINY_QUEUE").unwrap();

    let sender = producer.clone();
    let publisher = tokio::spawn(async move {
        let mut sent = 0;
        loop {
            // The third message goes over the limit and blocks until the producer is closed
            match sender.send(Message::new(vec![0xde; 1000])).await {
                Ok(_) => sent += 1,
                Err(e) => break (sent, e),
            }
        }
    });

    let gate = broker.destination("queue://TINY_QUEUE").unwrap();
    while gate.waiters() == 0 {
        tokio::task::yield_now().await;
    }

    producer.close().await.unwrap();

    let (sent, err) = publisher.await.unwrap();
    assert_eq!(sent, 2);
    assert_eq!(err, SendError::ProducerClosed(producer.id()));

    broker.shutdown().await;
}
