use clap::Parser;
use lambda_bootstrap::{Callback, Context, Dispatch, Handler};
use serde_json::{json, Value};

#[derive(Debug, Parser)]
struct Args {
    /// Built-in handler to serve (`app.lambdaHandler` or `app.echo`).
    #[arg(long, env = "_HANDLER", default_value = "app.lambdaHandler")]
    handler: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let code = lambda_bootstrap::run(move |cfg| {
        tracing::info!(
            handler = %args.handler,
            function_name = %cfg.function.function_name,
            "starting"
        );
        resolve(&args.handler)
    })
    .await?;

    std::process::exit(code);
}

/// Handlers compiled into this binary, selected by name.
#[derive(Debug, Clone, Copy)]
enum BuiltIn {
    HelloWorld,
    Echo,
}

impl Handler for BuiltIn {
    fn call(&self, event: Value, ctx: Context, callback: Callback) -> anyhow::Result<Dispatch> {
        match self {
            Self::HelloWorld => Ok(Dispatch::deferred(hello_world(event, ctx))),
            Self::Echo => echo(event, ctx, callback),
        }
    }
}

fn resolve(name: &str) -> anyhow::Result<BuiltIn> {
    match name {
        "app.lambdaHandler" => Ok(BuiltIn::HelloWorld),
        "app.echo" => Ok(BuiltIn::Echo),
        other => anyhow::bail!("unknown handler {other}"),
    }
}

async fn hello_world(_event: Value, _ctx: Context) -> anyhow::Result<Value> {
    Ok(json!({
        "statusCode": 200,
        "body": json!({ "message": "hello world" }).to_string(),
    }))
}

fn echo(event: Value, ctx: Context, callback: Callback) -> anyhow::Result<Dispatch> {
    ctx.set_wait_for_idle(false);
    callback.ok(json!({ "requestId": ctx.request_id(), "event": event }));
    Ok(Dispatch::Returned)
}
