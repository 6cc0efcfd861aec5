//! Stream - streaming values over a byte stream.
//!
//! This example demonstrates:
//! - Serving a stream operation with [`AppBuilder::map_stream`]
//! - Bridging both ports over a byte stream with [`StreamTransport`]
//! - Consuming the values through a typed [`RemoteStreamFn`] handle
//!
//! A `tokio::io::duplex` pipe stands in for a socket or child-process pipes.
//!
//! ```text
//! cargo run --example stream
//! ```

use std::time::Duration;

use futures::{stream, StreamExt};
use portwire::{AppBuilder, Caller, PortwireError, StreamTransport};
use serde::{Deserialize, Serialize};

/// Chunk structure sent in the stream.
#[derive(Serialize, Deserialize, Debug)]
struct Chunk {
    index: usize,
    data: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (left, right) = tokio::io::duplex(64 * 1024);
    let (left_r, left_w) = tokio::io::split(left);
    let (right_r, right_w) = tokio::io::split(right);

    let server = StreamTransport::spawn_default(right_r, right_w);
    let client = StreamTransport::spawn_default(left_r, left_w);

    let app = AppBuilder::new(server.port().clone())
        .map_stream("generate", |count: usize, _ctx| {
            stream::iter(0..count).then(|index| async move {
                // Simulate some work
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, PortwireError>(Chunk {
                    index,
                    data: format!("Chunk {}", index),
                })
            })
        })
        .build();

    let generate = Caller::new(client.port().clone()).stream_fn::<usize, Chunk>("generate");

    let mut chunks = generate.subscribe(&5)?;
    while let Some(chunk) = chunks.next().await {
        println!("{:?}", chunk?); // Chunk { index: 0, data: "Chunk 0" }, ...
    }

    app.shutdown().await;

    Ok(())
}
