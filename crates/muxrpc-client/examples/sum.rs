//! Starts a muxrpc server in-process, dials it, and issues a few calls.
//!
//! Run with: `cargo run --example sum`

use muxrpc_client::Client;
use muxrpc_server::{Server, Service};
use tokio::net::TcpListener;
use tracing::info;

struct Foo;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    info!("rpc server listening on {addr}");

    let server = Server::new();
    let service = server.register(
        Service::build("Foo", Foo)
            .method("Sum", |_foo: &Foo, n: i64, reply: &mut i64| {
                *reply = n * 2;
                Ok(())
            })
            .finish()?,
    )?;
    tokio::spawn(async move { server.accept(listener).await });

    let client = Client::dial(addr, None).await?;
    for i in 0..5i64 {
        let reply: i64 = client.call("Foo.Sum", &i).await?;
        info!("Foo.Sum({i}) = {reply}");
    }
    info!("Foo.Sum was invoked {:?} times", service.num_calls("Sum"));

    client.close().await?;
    Ok(())
}
