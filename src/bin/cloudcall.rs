//! cloudcall: run one provider CLI operation through the execution engine
//!
//! Usage:
//!   cloudcall [OPTIONS] <service> <operation> [key=value ...]

use anyhow::{bail, Context};
use cloudcall::{CliTransport, Engine, EngineConfig, Request};
use futures::StreamExt;
use serde_json::Value;

struct Args {
    config: Option<String>,
    paginate: Option<String>,
    program: String,
    no_cache: bool,
    service: String,
    operation: String,
    params: Vec<(String, Value)>,
}

fn print_usage() {
    println!(
        r#"cloudcall: cached, coalesced, concurrency-limited provider CLI calls

USAGE:
    cloudcall [OPTIONS] <service> <operation> [key=value ...]

OPTIONS:
    --config <file>          Engine configuration (YAML)
    --paginate <field>       Stream the operation, one item of <field> per line
    --program <name>         Provider CLI executable (default: aws)
    --no-cache               Bypass the cache for this call
    -h, --help               Show this help message
    -V, --version            Show version information

Parameter values are parsed as JSON when possible, otherwise taken as strings:
    cloudcall ec2 describe-instances max-items=5 'filters=[{{"Name":"tag:env","Values":["prod"]}}]'

ENVIRONMENT:
    CLOUDCALL_LOG            Log filter (falls back to RUST_LOG)
    CLOUDCALL_*              Configuration overrides (see EngineConfig::apply_env)"#
    );
}

fn parse_args(raw: &[String]) -> anyhow::Result<Option<Args>> {
    let mut config = None;
    let mut paginate = None;
    let mut program = "aws".to_string();
    let mut no_cache = false;
    let mut positional = Vec::new();

    let mut it = raw.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage();
                return Ok(None);
            }
            "-V" | "--version" => {
                println!("cloudcall {}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            "--config" => config = Some(it.next().context("--config needs a file")?.clone()),
            "--paginate" => paginate = Some(it.next().context("--paginate needs a field")?.clone()),
            "--program" => program = it.next().context("--program needs a name")?.clone(),
            "--no-cache" => no_cache = true,
            other if other.starts_with("--") => bail!("unknown option: {other}"),
            other => positional.push(other.to_string()),
        }
    }

    let mut positional = positional.into_iter();
    let (Some(service), Some(operation)) = (positional.next(), positional.next()) else {
        print_usage();
        bail!("missing <service> <operation>");
    };
    let params = positional
        .map(|kv| {
            let (k, v) = kv
                .split_once('=')
                .with_context(|| format!("expected key=value, got '{kv}'"))?;
            let value = serde_json::from_str(v).unwrap_or_else(|_| Value::String(v.to_string()));
            Ok((k.to_string(), value))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(Some(Args {
        config,
        paginate,
        program,
        no_cache,
        service,
        operation,
        params,
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cloudcall::telemetry::init_tracing();

    let raw: Vec<String> = std::env::args().skip(1).collect();
    let Some(args) = parse_args(&raw)? else {
        return Ok(());
    };

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path).with_context(|| format!("loading {path}"))?,
        None => EngineConfig::default(),
    }
    .apply_env();

    let engine = Engine::builder()
        .with_config(config)
        .with_transport(CliTransport::new(&args.program))
        .build()
        .await
        .context("building engine")?;
    let maintenance = engine.spawn_maintenance();

    let mut request = Request::new(&args.service, &args.operation);
    for (k, v) in args.params {
        request = request.param(k, v);
    }
    if args.no_cache {
        request = request.no_cache();
    }

    let outcome = match &args.paginate {
        Some(field) => {
            let mut items = engine.paginate(request, field.clone()).stream();
            let mut count = 0usize;
            let mut failure = None;
            while let Some(item) = items.next().await {
                match item {
                    Ok(v) => {
                        println!("{}", serde_json::to_string(&v)?);
                        count += 1;
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            eprintln!("{count} items, {} pages", items.stats().pages_fetched);
            failure.map_or(Ok(()), Err)
        }
        None => match engine.execute(&request).await {
            Ok(v) => {
                println!("{}", serde_json::to_string_pretty(&v)?);
                Ok(())
            }
            Err(e) => Err(e),
        },
    };

    eprintln!("{}", engine.snapshot().await);
    engine.shutdown();
    if let Some(handle) = maintenance {
        let _ = handle.await;
    }
    outcome.map_err(anyhow::Error::from)
}
