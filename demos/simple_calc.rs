use std::sync::Arc;

use tracing::{info, Level};

use comlink::auth::{Credentials, NullAuthProvider};
use comlink::client::pipeline::ClientPipeline;
use comlink::config::CoreConfig;
use comlink::dispatch::catalog::{Activation, ComponentBuilder, ComponentCatalog};
use comlink::dispatch::dispatcher::ServerDispatcher;
use comlink::fault::Fault;
use comlink::session::InMemorySessionStore;
use comlink::transport::endpoint::Endpoint;
use comlink::wire::value::Value;

struct Calc;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let catalog = Arc::new(ComponentCatalog::new());
    catalog.register(
        ComponentBuilder::new("ICalc", Activation::PerCall, || Calc)
            .method2("Add", |_: &Calc, a: i32, b: i32| Ok(a + b))
            .method2("Div", |_: &Calc, a: i32, b: i32| {
                if b == 0 {
                    Err(Fault::Target("division by zero".to_owned()))
                } else {
                    Ok(a / b)
                }
            })
            .build(),
    )?;

    let dispatcher = ServerDispatcher::new(
        catalog,
        Arc::new(InMemorySessionStore::new(60)),
        Arc::new(NullAuthProvider),
    );
    let server = Endpoint::bind("127.0.0.1:0".parse()?, Arc::new(dispatcher), CoreConfig::new()).await?;
    let server_addr = server.local_addr().expect("bound server has an address");
    info!("calc server listening on {}", server_addr);

    let pipeline = Arc::new(ClientPipeline::new(server_addr, CoreConfig::new()));
    let session = pipeline
        .logon(Credentials::new().with_entry("name", "demo"))
        .await?;
    info!("logged on with session {:?}", session);

    let calc = pipeline.remote_object("ICalc");
    let add = calc.invoke("Add", vec![Value::I32(2), Value::I32(3)]).await?;
    info!("Add(2, 3) = {:?}", add);
    let div = calc.invoke("Div", vec![Value::I32(42), Value::I32(6)]).await?;
    info!("Div(42, 6) = {:?}", div);
    let div_by_zero = calc.invoke("Div", vec![Value::I32(1), Value::I32(0)]).await;
    info!("Div(1, 0) -> {:?}", div_by_zero);

    pipeline.logoff().await?;
    pipeline.shutdown().await;
    server.shutdown().await;
    Ok(())
}
