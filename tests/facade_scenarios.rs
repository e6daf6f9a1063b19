mod support;

use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use bizmq::rabbitmq::errors::{REPLY_NOT_FOUND, REPLY_PRECONDITION_FAILED};
use bizmq::rabbitmq::HealthStatus;
use bizmq::{
    BindingSpec, ConsumeOptions, ExchangeSpec, ExchangeType, HandlerOutcome, MessageProperties,
    MessagingConfig, MessagingError, Payload, QueueSpec, TopologyConfig,
};
use support::{client, client_with, eventually, recv, Forwarding};

#[tokio::test]
async fn bound_queue_receives_published_message() {
    let (_broker, client) = client();
    client
        .declare_exchange(&ExchangeSpec::new("orders", ExchangeType::Direct))
        .await
        .unwrap();
    client.declare_queue(&QueueSpec::new("orders.created")).await.unwrap();
    client
        .bind_queue(&BindingSpec::new("orders.created", "orders", "created"))
        .await
        .unwrap();

    let order = Payload::from(json!({"order_id": 1042, "total": 99.5}));
    client
        .publish_message("orders", "created", &order, None, false)
        .await
        .unwrap();

    let delivery = client.get_message("orders.created", true).await.unwrap().unwrap();
    assert_eq!(delivery.payload(), order);
    assert_eq!(delivery.routing_key, "created");
    assert!(client.get_message("orders.created", true).await.unwrap().is_none());
}

#[tokio::test]
async fn redeclaring_is_idempotent_and_conflicts_do_not_poison_the_client() {
    let (_broker, client) = client();
    let audit = ExchangeSpec::new("audit", ExchangeType::Topic);
    client.declare_exchange(&audit).await.unwrap();
    client.declare_exchange(&audit).await.unwrap();

    let conflicting = ExchangeSpec::new("audit", ExchangeType::Fanout);
    let err = client.declare_exchange(&conflicting).await.unwrap_err();
    assert!(matches!(
        err,
        MessagingError::ChannelClosed { code: REPLY_PRECONDITION_FAILED, .. }
    ));

    // the channel was reopened behind the scenes
    let name = client.declare_queue(&QueueSpec::new("audit.log")).await.unwrap();
    assert_eq!(name, "audit.log");
    assert!(client.health_check().await.channel_open);
}

#[tokio::test]
async fn queue_redeclare_returns_the_same_name_and_conflicts_recover() {
    let (broker, client) = client();
    let spec = QueueSpec::new("invoices").dead_letter_exchange("invoices.dlx");
    let first = client.declare_queue(&spec).await.unwrap();
    let second = client.declare_queue(&spec).await.unwrap();
    assert_eq!(first, "invoices");
    assert_eq!(first, second);

    client.publish_to_queue("invoices", &Payload::from("kept"), None).await.unwrap();

    let conflicting = QueueSpec::new("invoices").max_length(5);
    let err = client.declare_queue(&conflicting).await.unwrap_err();
    assert!(matches!(
        err,
        MessagingError::ChannelClosed { code: REPLY_PRECONDITION_FAILED, .. }
    ));

    // the failed redeclare neither broke the client nor touched the queue
    assert_eq!(client.declare_queue(&spec).await.unwrap(), "invoices");
    assert_eq!(broker.queue_depth("invoices"), Some(1));

    let generated = client.declare_queue(&QueueSpec::server_named()).await.unwrap();
    assert!(generated.starts_with("amq.gen-"));
}

#[tokio::test]
async fn json_payloads_round_trip_with_default_properties() {
    let (_broker, client) = client();
    client.declare_queue(&QueueSpec::new("reports")).await.unwrap();

    let body = json!({"report": "monthly", "rows": [1, 2, 3], "meta": {"tenant": "acme"}});
    client
        .publish_to_queue("reports", &Payload::from(body.clone()), None)
        .await
        .unwrap();

    let delivery = client.get_message("reports", true).await.unwrap().unwrap();
    assert_eq!(delivery.payload().as_json(), Some(&body));

    let props = &delivery.properties;
    assert!(props.is_persistent());
    assert_eq!(props.content_type.as_deref(), Some("application/json"));
    assert_eq!(props.app_id.as_deref(), Some("bizmq"));
    assert!(props.message_id.is_some());
    assert!(props.created_at().is_some());
}

#[tokio::test]
async fn explicit_properties_are_sent_as_given() {
    let (_broker, client) = client();
    client.declare_queue(&QueueSpec::new("replies")).await.unwrap();

    let props = MessageProperties::default()
        .with_correlation_id("req-7")
        .with_reply_to("amq.rabbitmq.reply-to")
        .with_header("tenant", "acme");
    client
        .publish_to_queue("replies", &Payload::from("pong"), Some(props.clone()))
        .await
        .unwrap();

    let delivery = client.get_message("replies", true).await.unwrap().unwrap();
    assert_eq!(delivery.properties, props);
    assert_eq!(delivery.payload(), Payload::Text("pong".into()));
}

#[tokio::test]
async fn ack_removes_and_requeue_redelivers() {
    let (_broker, client) = client();
    client.declare_queue(&QueueSpec::new("jobs")).await.unwrap();

    client.publish_to_queue("jobs", &Payload::from("first"), None).await.unwrap();
    let first = client.get_message("jobs", false).await.unwrap().unwrap();
    client.ack_message(first.delivery_tag).await.unwrap();
    assert_eq!(client.get_queue_info("jobs").await.unwrap().unwrap().message_count, 0);

    client.publish_to_queue("jobs", &Payload::from("second"), None).await.unwrap();
    let second = client.get_message("jobs", false).await.unwrap().unwrap();
    assert!(!second.redelivered);
    client.nack_message(second.delivery_tag, true).await.unwrap();

    let again = client.get_message("jobs", false).await.unwrap().unwrap();
    assert!(again.redelivered);
    assert_eq!(again.payload(), Payload::Text("second".into()));
    client.ack_message(again.delivery_tag).await.unwrap();
}

#[tokio::test]
async fn purge_reports_how_many_messages_were_dropped() {
    let (broker, client) = client();
    client.declare_queue(&QueueSpec::new("bulk")).await.unwrap();
    for n in 0..5 {
        client
            .publish_to_queue("bulk", &Payload::from(json!({ "n": n })), None)
            .await
            .unwrap();
    }

    assert_eq!(client.purge_queue("bulk").await.unwrap(), 5);
    assert_eq!(broker.queue_depth("bulk"), Some(0));
}

#[tokio::test]
async fn delete_queue_and_exchange() {
    let (broker, client) = client();
    client
        .declare_exchange(&ExchangeSpec::new("tmp.x", ExchangeType::Fanout))
        .await
        .unwrap();
    client.declare_queue(&QueueSpec::new("tmp.q")).await.unwrap();
    client.bind_queue(&BindingSpec::new("tmp.q", "tmp.x", "")).await.unwrap();
    client.publish_message("tmp.x", "", &Payload::from("x"), None, false).await.unwrap();

    let err = client.delete_queue("tmp.q", false, true).await.unwrap_err();
    assert!(matches!(
        err,
        MessagingError::ChannelClosed { code: REPLY_PRECONDITION_FAILED, .. }
    ));
    assert!(client.delete_exchange("tmp.x", true).await.is_err());

    assert_eq!(client.delete_queue("tmp.q", false, false).await.unwrap(), 1);
    assert!(client.get_queue_info("tmp.q").await.unwrap().is_none());

    client.delete_exchange("tmp.x", true).await.unwrap();
    assert!(!broker.exchange_exists("tmp.x"));
}

#[tokio::test]
async fn duplicate_background_consumer_is_rejected_and_stop_clears_health() {
    let (_broker, client) = client();
    client.declare_queue(&QueueSpec::new("orders.tasks")).await.unwrap();

    let (handler, _deliveries) = Forwarding::new();
    let handler = Arc::new(handler);
    client
        .consume_messages_async("orders.tasks", handler.clone(), ConsumeOptions::default())
        .unwrap();

    let err = client
        .consume_messages_async("orders.tasks", handler, ConsumeOptions::default())
        .unwrap_err();
    assert!(matches!(err, MessagingError::ConsumerAlreadyActive(ref q) if q == "orders.tasks"));

    let report = client.health_check().await;
    assert_eq!(report.active_consumers, 1);
    assert_eq!(report.consumer_queues, vec!["orders.tasks".to_string()]);

    client.stop_consumer("orders.tasks").await.unwrap();
    let report = client.health_check().await;
    assert_eq!(report.active_consumers, 0);
    assert!(client.active_consumers().is_empty());
}

#[tokio::test]
async fn orders_tasks_are_processed_by_a_background_worker() {
    let (broker, client) = client();
    client.declare_queue(&QueueSpec::new("orders.tasks")).await.unwrap();

    let (handler, mut deliveries) = Forwarding::new();
    let handle = client
        .consume_messages_async("orders.tasks", Arc::new(handler), ConsumeOptions::default())
        .unwrap();
    assert_eq!(handle.queue, "orders.tasks");

    for id in 1..=3 {
        client
            .publish_to_queue("orders.tasks", &Payload::from(json!({"order_id": id})), None)
            .await
            .unwrap();
    }

    for id in 1..=3 {
        let delivery = recv(&mut deliveries).await;
        assert_eq!(delivery.payload(), Payload::from(json!({"order_id": id})));
    }
    assert_eq!(broker.queue_depth("orders.tasks"), Some(0));
    assert_eq!(broker.unacked_count(), 0);

    client.stop_consumer("orders.tasks").await.unwrap();
}

#[tokio::test]
async fn health_check_reconnects_exactly_once_when_disconnected() {
    let config = MessagingConfig::default();
    assert!(config.reconnect.max_attempts > 1);
    let (broker, client) = client_with(config);
    broker.set_available(false);

    let started = Instant::now();
    let report = client.health_check().await;
    // no backoff sleep between attempts
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(report.status, HealthStatus::Unhealthy);
    assert!(report.reconnect_attempted);
    assert_eq!(report.reconnect_succeeded, Some(false));
    assert!(!report.connection.is_connected);
    assert_eq!(broker.connect_attempts(), 1);

    broker.set_available(true);
    let report = client.health_check().await;
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(report.reconnect_succeeded, Some(true));
    assert_eq!(broker.connect_attempts(), 2);

    let report = client.health_check().await;
    assert!(!report.reconnect_attempted);
    assert_eq!(broker.connect_attempts(), 2);
}

#[tokio::test]
async fn operations_reconnect_after_the_broker_drops_connections() {
    let (broker, client) = client();
    client.declare_queue(&QueueSpec::new("resilient")).await.unwrap();

    broker.drop_connections();
    assert!(!client.is_connected().await);

    client
        .publish_to_queue("resilient", &Payload::from("after outage"), None)
        .await
        .unwrap();
    assert_eq!(broker.queue_depth("resilient"), Some(1));
    assert_eq!(broker.connect_attempts(), 2);
}

#[tokio::test]
async fn delivery_tags_from_a_replaced_channel_are_rejected() {
    let (_broker, client) = client();
    client.declare_queue(&QueueSpec::new("jobs")).await.unwrap();
    client.publish_to_queue("jobs", &Payload::from("work"), None).await.unwrap();
    let delivery = client.get_message("jobs", false).await.unwrap().unwrap();

    // a passive lookup of a missing queue closes the channel; the client reopens it
    assert!(client.get_queue_info("missing").await.unwrap().is_none());

    let err = client.ack_message(delivery.delivery_tag).await.unwrap_err();
    assert!(matches!(err, MessagingError::StaleDeliveryTag { tag } if tag == delivery.delivery_tag));

    let redelivered = client.get_message("jobs", true).await.unwrap().unwrap();
    assert!(redelivered.redelivered);
}

#[tokio::test]
async fn mandatory_publish_to_nowhere_is_unroutable() {
    let (_broker, client) = client();
    client
        .declare_exchange(&ExchangeSpec::new("events", ExchangeType::Topic))
        .await
        .unwrap();

    let err = client
        .publish_message("events", "nobody.listens", &Payload::from("lost"), None, true)
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::Unroutable { ref routing_key, .. } if routing_key == "nobody.listens"));

    client
        .publish_message("events", "nobody.listens", &Payload::from("lost"), None, false)
        .await
        .unwrap();
}

#[tokio::test]
async fn unbinding_stops_routing() {
    let (_broker, client) = client();
    client
        .declare_exchange(&ExchangeSpec::new("alerts", ExchangeType::Direct))
        .await
        .unwrap();
    client.declare_queue(&QueueSpec::new("pager")).await.unwrap();
    let binding = BindingSpec::new("pager", "alerts", "critical");
    client.bind_queue(&binding).await.unwrap();
    client.unbind_queue(&binding).await.unwrap();

    let err = client
        .publish_message("alerts", "critical", &Payload::from("disk full"), None, true)
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::Unroutable { .. }));
}

#[tokio::test]
async fn publishing_to_a_missing_exchange_fails_and_recovers() {
    let (_broker, client) = client();
    let err = client
        .publish_message("does.not.exist", "key", &Payload::from("x"), None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::ChannelClosed { code: REPLY_NOT_FOUND, .. }));

    client.declare_queue(&QueueSpec::new("after")).await.unwrap();
}

#[tokio::test]
async fn rejected_messages_reach_the_dead_letter_queue() {
    let (broker, client) = client();
    let topology = TopologyConfig::application_defaults("test", &["billing"]);
    client.bootstrap_topology(&topology).await.unwrap();

    client
        .publish_message(
            "test.events",
            "billing.invoice.created",
            &Payload::from(json!({"invoice": 17})),
            None,
            true,
        )
        .await
        .unwrap();

    let delivery = client.get_message("test.billing.tasks", false).await.unwrap().unwrap();
    client.nack_message(delivery.delivery_tag, false).await.unwrap();

    assert_eq!(broker.queue_depth("test.billing.tasks"), Some(0));
    let dead = client.get_message("test.dead_letters", true).await.unwrap().unwrap();
    assert_eq!(dead.payload(), Payload::from(json!({"invoice": 17})));
    assert_eq!(dead.properties.headers["x-first-death-reason"], json!("rejected"));
}

#[tokio::test]
async fn bootstrap_declares_the_default_layout() {
    let (broker, client) = client();
    client.bootstrap_topology(&TopologyConfig::default()).await.unwrap();

    assert!(broker.exchange_exists("bizmq.events"));
    assert!(broker.exchange_exists("bizmq.dlx"));
    assert_eq!(broker.bindings("bizmq.events").len(), 5);
    for domain in ["business", "marketing", "training", "finance", "notification"] {
        let queue = format!("bizmq.{}.tasks", domain);
        assert!(client.get_queue_info(&queue).await.unwrap().is_some(), "{queue} missing");
    }

    // bootstrapping twice is harmless
    client.bootstrap_topology(&TopologyConfig::default()).await.unwrap();
}

#[tokio::test]
async fn registered_handler_acks_success_and_requeues_failures() {
    let (broker, client) = client();
    client.declare_queue(&QueueSpec::new("emails")).await.unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = attempts.clone();
    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .register_message_handler(
            "emails",
            move |payload: Payload, _props: MessageProperties| {
                let attempt = seen.fetch_add(1, Ordering::SeqCst) + 1;
                let tx = tx.clone();
                async move {
                    let _ = tx.send((attempt, payload));
                    match attempt {
                        1 => Err(anyhow::anyhow!("smtp timeout")),
                        2 => Ok(HandlerOutcome::Requeue),
                        3 => panic!("template missing"),
                        _ => Ok(HandlerOutcome::Ack),
                    }
                }
            },
            false,
        )
        .unwrap();

    let welcome = Payload::from(json!({"template": "welcome"}));
    client.publish_to_queue("emails", &welcome, None).await.unwrap();

    for expected in 1..=4 {
        let (attempt, payload) = recv(&mut rx).await;
        assert_eq!(attempt, expected);
        assert_eq!(payload, welcome);
    }

    eventually(|| broker.unacked_count() == 0 && broker.queue_depth("emails") == Some(0)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 4);

    client.unregister_message_handler("emails").await.unwrap();
    assert!(client.active_consumers().is_empty());
}

#[tokio::test]
async fn blocking_consume_returns_when_cancelled() {
    let (_broker, client) = client();
    client.declare_queue(&QueueSpec::new("inbox")).await.unwrap();
    for n in 0..2 {
        client
            .publish_to_queue("inbox", &Payload::from(json!({ "n": n })), None)
            .await
            .unwrap();
    }

    let (handler, mut deliveries) = Forwarding::new();
    let cancel = CancellationToken::new();
    let options = ConsumeOptions::default();
    let consume = client.consume_messages("inbox", &handler, &options, &cancel);
    let driver = async {
        recv(&mut deliveries).await;
        recv(&mut deliveries).await;
        cancel.cancel();
    };

    let (result, ()) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(consume, driver)
    })
    .await
    .expect("consume loop did not stop");
    result.unwrap();

    // the primary channel was never tied up by the consumer
    assert_eq!(client.get_queue_info("inbox").await.unwrap().unwrap().message_count, 0);
}

#[tokio::test]
async fn close_is_idempotent_and_stops_consumers() {
    let (broker, client) = client();
    client.declare_queue(&QueueSpec::new("jobs")).await.unwrap();
    let (handler, _deliveries) = Forwarding::new();
    client
        .consume_messages_async("jobs", Arc::new(handler), ConsumeOptions::default())
        .unwrap();

    client.close().await.unwrap();
    assert!(client.active_consumers().is_empty());
    assert!(!client.is_connected().await);
    client.close().await.unwrap();

    // later operations reconnect lazily
    client.declare_queue(&QueueSpec::new("jobs")).await.unwrap();
    assert!(client.is_connected().await);
    assert!(broker.connect_attempts() >= 2);
}

#[tokio::test]
async fn stopping_an_unknown_consumer_is_an_error() {
    let (_broker, client) = client();
    let err = client.stop_consumer("ghost").await.unwrap_err();
    assert!(matches!(err, MessagingError::ConsumerNotFound(ref q) if q == "ghost"));
}
