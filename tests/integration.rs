//! Integration tests for portwire.
//!
//! These tests drive both engines end to end over in-memory channels and
//! over byte streams.

use std::time::Duration;

use futures::{stream, StreamExt};
use portwire::codec::MsgPackCodec;
use portwire::protocol::{decode_message_frame, encode_message_frame, FrameBuffer, FRAME_HEADER_SIZE};
use portwire::transport::Inbox;
use portwire::{
    AppBuilder, Caller, Connection, CorrelationId, Message, MessageChannel, PortwireError,
    Responder, ResponderConfig, StreamTransport,
};
use serde_json::{json, Value};
use tokio::io::duplex;
use tokio::sync::mpsc;

async fn next(inbox: &mut Inbox) -> Message {
    tokio::time::timeout(Duration::from_secs(1), inbox.recv_message())
        .await
        .expect("timed out waiting for message")
        .expect("port closed")
}

async fn assert_quiet(inbox: &mut Inbox) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(inbox.try_recv().is_none(), "unexpected extra message");
}

/// Test a message through frame encode, fragmented reads and decode.
#[test]
fn test_message_frame_fragmented() {
    let message = Message::stream_emit(3, json!({"values": [1, 2, 3], "label": "fragmented"}));
    let frame = encode_message_frame(&message.encode().unwrap()).unwrap();

    let mut buffer = FrameBuffer::new();
    assert!(buffer.push(&frame[..2]).unwrap().is_empty());
    assert!(buffer.push(&frame[2..FRAME_HEADER_SIZE + 3]).unwrap().is_empty());

    let frames = buffer.push(&frame[FRAME_HEADER_SIZE + 3..]).unwrap();
    assert_eq!(frames.len(), 1);

    let decoded = Message::decode(&decode_message_frame(&frames[0]).unwrap()).unwrap();
    assert_eq!(decoded, message);
}

/// Test that envelopes encode with named MsgPack fields.
#[test]
fn test_msgpack_envelope_has_named_kind() {
    let bytes = MsgPackCodec::encode(&Message::abort("x").encode().unwrap()).unwrap();
    let value: Value = MsgPackCodec::decode(&bytes).unwrap();
    assert_eq!(value["kind"], json!("portwire/v1/messages/abort"));
    assert_eq!(value["id"], json!("x"));
}

/// Future handler "foo" answers a bare future call with exactly one reply.
#[tokio::test]
async fn test_scenario_future_call_resolves() {
    let (caller, port) = MessageChannel::new();
    let mut inbox = caller.inbox();
    let responder = Responder::new(port, ResponderConfig::default());
    responder.register_future_handler("foo", |s: String, _ctx| async move {
        Ok(format!("{}-ok", s))
    });
    responder.start();

    caller.send_message(&Message::future_call(1, json!("bar"))).unwrap();

    assert_eq!(next(&mut inbox).await, Message::resolved(1, json!("bar-ok")));
    assert_quiet(&mut inbox).await;
}

/// Stream handler emits two values then completes, nothing after.
#[tokio::test]
async fn test_scenario_stream_emits_and_completes() {
    let (caller, port) = MessageChannel::new();
    let mut inbox = caller.inbox();
    let _app = AppBuilder::new(port)
        .map_stream("stream", |n: u32, _ctx| {
            stream::iter(vec![Ok(format!("v{}", n)), Ok(format!("w{}", n))])
        })
        .build();

    caller.send_message(&Message::stream_subscribe(1, json!(7))).unwrap();

    assert_eq!(next(&mut inbox).await, Message::stream_emit(1, json!("v7")));
    assert_eq!(next(&mut inbox).await, Message::stream_emit(1, json!("w7")));
    assert_eq!(next(&mut inbox).await, Message::stream_complete(1));
    assert_quiet(&mut inbox).await;
}

/// A named call for an unregistered operation is rejected.
#[tokio::test]
async fn test_scenario_unknown_function() {
    let (caller, port) = MessageChannel::new();
    let mut inbox = caller.inbox();
    let _app = AppBuilder::new(port)
        .map_future("known", |_: (), _ctx| async move { Ok(()) })
        .build();

    caller
        .send_message(&Message::future_call(7, json!({"function": "nope"})))
        .unwrap();

    assert_eq!(
        next(&mut inbox).await,
        Message::rejected(7, json!("Unknown promise function: nope"))
    );
}

/// A call that never found a handler is rejected on shutdown.
#[tokio::test]
async fn test_scenario_shutdown_rejects_pending() {
    let (caller, port) = MessageChannel::new();
    let mut inbox = caller.inbox();
    let responder = Responder::new(port, ResponderConfig::default());
    responder.start();

    caller.send_message(&Message::future_call(99, json!(null))).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(responder.active_requests().await.len(), 1);

    responder.shutdown().await;

    assert_eq!(
        next(&mut inbox).await,
        Message::rejected(99, json!("Connection closed"))
    );
    assert!(responder.active_requests().await.is_empty());
}

/// Two connections over one parent channel never see each other's calls.
#[tokio::test]
async fn test_scenario_connections_are_isolated() {
    let (host, worker) = MessageChannel::new();
    let (tx, mut accepted) = mpsc::unbounded_channel();

    let tx_b = tx.clone();
    let _listen_a = Connection::listen("a", &worker, move |conn| {
        let _ = tx.send(conn);
    });
    let _listen_b = Connection::listen("b", &worker, move |conn| {
        let _ = tx_b.send(conn);
    });

    let conn_a = Connection::connect("a", &host).unwrap();
    let conn_b = Connection::connect("b", &host).unwrap();

    let accepted_a = accepted.recv().await.unwrap();
    let accepted_b = accepted.recv().await.unwrap();
    assert_eq!(accepted_a.id(), "a");
    assert_eq!(accepted_b.id(), "b");

    let responder_a = Responder::new(accepted_a.into_port(), ResponderConfig::default());
    let responder_b = Responder::new(accepted_b.into_port(), ResponderConfig::default());
    responder_a.start();
    responder_b.start();

    // Neither side has handlers, so every call stays visible in the active set.
    conn_a
        .port()
        .send_message(&Message::future_call(1, json!("for a")))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let seen_a = responder_a.active_requests().await;
    assert_eq!(seen_a.len(), 1);
    assert_eq!(seen_a[0].id, CorrelationId::from(1));
    assert!(responder_b.active_requests().await.is_empty());

    let mut inbox_b = conn_b.port().inbox();
    responder_a.shutdown().await;
    responder_b.shutdown().await;
    assert_quiet(&mut inbox_b).await;
}

/// Replies delivered out of order still resolve the right calls.
#[tokio::test]
async fn test_correlation_integrity_out_of_order() {
    let (port, remote) = MessageChannel::new();
    let mut requests = remote.inbox();
    let caller = Caller::new(port);

    let first = tokio::spawn({
        let caller = caller.clone();
        async move { caller.call_raw(json!("first"), None).await }
    });
    let first_request = next(&mut requests).await;

    let second = tokio::spawn({
        let caller = caller.clone();
        async move { caller.call_raw(json!("second"), None).await }
    });
    let second_request = next(&mut requests).await;

    let first_id = first_request.correlation_id().cloned().unwrap();
    let second_id = second_request.correlation_id().cloned().unwrap();
    assert_ne!(first_id, second_id);

    remote
        .send_message(&Message::resolved(second_id, json!("answer 2")))
        .unwrap();
    remote
        .send_message(&Message::resolved(first_id, json!("answer 1")))
        .unwrap();

    assert_eq!(first.await.unwrap().unwrap(), json!("answer 1"));
    assert_eq!(second.await.unwrap().unwrap(), json!("answer 2"));
}

/// Calls issued before any handler exists are served once one registers.
#[tokio::test]
async fn test_calls_before_handler_registration() {
    let (client, server) = MessageChannel::new();
    let responder = Responder::new(server, ResponderConfig::default());
    responder.start();

    let caller = Caller::new(client);
    let call = tokio::spawn({
        let caller = caller.clone();
        async move { caller.call("double", vec![json!(21)], None).await }
    });
    let mut ticks = caller.stream("ticks", vec![json!(2)]).unwrap();
    let ticks = tokio::spawn(async move {
        let mut values = Vec::new();
        while let Some(value) = ticks.next().await {
            values.push(value.unwrap());
        }
        values
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(responder.active_requests().await.len(), 2);

    responder.register_future_handler("double", |n: i64, _ctx| async move { Ok(n * 2) });
    responder.register_stream_handler("ticks", |n: u32, _ctx| stream::iter((0..n).map(Ok)));

    assert_eq!(call.await.unwrap().unwrap(), json!(42));
    assert_eq!(ticks.await.unwrap(), vec![json!(0), json!(1)]);
}

/// A queued named call survives registration of an unrelated operation.
#[tokio::test]
async fn test_queued_call_waits_for_matching_handler() {
    let (client, server) = MessageChannel::new();
    let responder = Responder::new(server, ResponderConfig::default());
    responder.start();

    let caller = Caller::new(client);
    let call = tokio::spawn({
        let caller = caller.clone();
        async move { caller.call("b", vec![], None).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    responder.register_future_handler("a", |_: (), _ctx| async move { Ok("a") });
    responder.register_future_handler("b", |_: (), _ctx| async move { Ok("b") });

    let result = tokio::time::timeout(Duration::from_secs(1), call)
        .await
        .expect("call never settled")
        .unwrap();
    assert_eq!(result.unwrap(), json!("b"));
}

/// Full round trip over a byte stream with typed handles on both ends.
#[tokio::test]
async fn test_end_to_end_over_byte_stream() {
    let (left, right) = duplex(64 * 1024);
    let (left_r, left_w) = tokio::io::split(left);
    let (right_r, right_w) = tokio::io::split(right);

    let server = StreamTransport::spawn_default(right_r, right_w);
    let client = StreamTransport::spawn_default(left_r, left_w);

    let _app = AppBuilder::new(server.port().clone())
        .map_future("concat", |(a, b): (String, String), _ctx| async move {
            Ok(format!("{}{}", a, b))
        })
        .map_stream("range", |(start, end): (u32, u32), _ctx| {
            stream::iter((start..end).map(Ok))
        })
        .build();

    let caller = Caller::new(client.port().clone());

    let concat = caller.future_fn::<(String, String), String>("concat");
    let joined = concat
        .call(&("port".to_string(), "wire".to_string()))
        .await
        .unwrap();
    assert_eq!(joined, "portwire");

    let range = caller.stream_fn::<(u32, u32), u32>("range");
    let values: Vec<u32> = range
        .subscribe(&(3, 6))
        .unwrap()
        .map(|v| v.unwrap())
        .collect()
        .await;
    assert_eq!(values, vec![3, 4, 5]);
}

/// Dropping a caller stream stops the remote producer.
#[tokio::test]
async fn test_dropping_stream_unsubscribes() {
    let (client, server) = MessageChannel::new();
    let app = AppBuilder::new(server)
        .map_stream("forever", |_: (), _ctx| {
            stream::unfold(0u64, |n| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Some((Ok(n), n + 1))
            })
        })
        .build();

    let caller = Caller::new(client);
    let mut forever = caller.stream("forever", vec![]).unwrap();
    assert_eq!(forever.next().await.unwrap().unwrap(), json!(0));
    drop(forever);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(app.active_requests().await.is_empty());
}

/// Shutdown fails outstanding caller requests of both shapes.
#[tokio::test]
async fn test_shutdown_reaches_callers() {
    let (client, server) = MessageChannel::new();
    let app = AppBuilder::new(server)
        .map_future("hang", |_: (), _ctx| std::future::pending::<portwire::Result<()>>())
        .map_stream("silent", |_: (), _ctx| stream::pending::<portwire::Result<()>>())
        .build();

    let caller = Caller::new(client);
    let call = tokio::spawn({
        let caller = caller.clone();
        async move { caller.call("hang", vec![], None).await }
    });
    let mut silent = caller.stream("silent", vec![]).unwrap();
    let stream_result = tokio::spawn(async move { silent.next().await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    app.shutdown().await;

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.to_string(), "Connection closed");

    let item = stream_result.await.unwrap().unwrap();
    assert!(matches!(item, Err(PortwireError::Remote(_))));
}
