//! Requires a running RabbitMQ; run with `cargo test -- --ignored`.

use serde_json::json;

use bizmq::{MessagingConfig, Payload, QueueSpec, RabbitMQClient};

#[tokio::test]
#[ignore]
async fn round_trip_against_a_live_broker() {
    let config = MessagingConfig::load().expect("config");
    let client = RabbitMQClient::amqp(config);
    client.connect().await.expect("RabbitMQ should be reachable");

    let queue = client
        .declare_queue(&QueueSpec::server_named().transient().exclusive().auto_delete())
        .await
        .unwrap();
    assert!(queue.starts_with("amq.gen-"));

    let payload = Payload::from(json!({"check": "live"}));
    client.publish_to_queue(&queue, &payload, None).await.unwrap();

    let mut delivery = None;
    for _ in 0..20 {
        delivery = client.get_message(&queue, false).await.unwrap();
        if delivery.is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    let delivery = delivery.expect("message should arrive");
    assert_eq!(delivery.payload(), payload);
    client.ack_message(delivery.delivery_tag).await.unwrap();

    let report = client.health_check().await;
    assert!(report.is_healthy());
    client.close().await.unwrap();
}
