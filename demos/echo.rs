//! Echo - simple future call example.
//!
//! This example demonstrates:
//! - Serving a named operation with [`AppBuilder::map_future`]
//! - Calling it through a typed [`RemoteFn`] handle
//! - Getting a rejection back for an operation nobody mapped
//!
//! Both ends live in one process and talk over an in-memory
//! [`MessageChannel`].
//!
//! ```text
//! cargo run --example echo
//! ```

use portwire::{AppBuilder, CallContext, Caller, MessageChannel};
use serde::{Deserialize, Serialize};

/// Input structure for the echo operation.
#[derive(Serialize, Deserialize, Debug)]
struct EchoInput {
    message: String,
}

/// Output structure for the echo operation.
#[derive(Serialize, Deserialize, Debug)]
struct EchoOutput {
    echo: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (client_port, app_port) = MessageChannel::new();

    let app = AppBuilder::new(app_port)
        .map_future("echo", |data: EchoInput, ctx: CallContext| async move {
            println!("serving call {}", ctx.correlation_id());
            Ok(EchoOutput { echo: data.message })
        })
        .build();

    let caller = Caller::new(client_port);

    let echo = caller.future_fn::<EchoInput, EchoOutput>("echo");
    let output = echo
        .call(&EchoInput {
            message: "hello".to_string(),
        })
        .await?;
    println!("{:?}", output); // EchoOutput { echo: "hello" }

    let missing = caller.future_fn::<(), ()>("shout");
    if let Err(e) = missing.call(&()).await {
        println!("{}", e); // Unknown promise function: shout
    }

    app.shutdown().await;
    caller.close();

    Ok(())
}
