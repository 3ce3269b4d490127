mod cli;

use log::{info, warn};
use serde_json::json;
use std::sync::Arc;
use weightgate::config::Config;
use weightgate::http::ReqwestTransport;
use weightgate::{
    dimension_id, CancellationToken, QueryClient, QueryWeight, RateLimitKind, RateLimitRegistry,
    RequestDescriptor,
};

#[tokio::main(flavor = "current_thread")] // queries run one after another
async fn main() -> anyhow::Result<()> {
    let opts = cli::parse_options(cli::build_cli());

    cli::init_logging(opts.log_level.as_deref());

    if opts.version {
        println!("weightgate {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let cfg = Config::from_env().map_err(anyhow::Error::msg)?;
    let transport = ReqwestTransport::new(&cfg)?;
    let registry =
        RateLimitRegistry::new().with_header_prefix(cfg.usage_header_prefix.clone());
    let client = QueryClient::new(Arc::new(registry), Arc::new(transport));
    let cancel = CancellationToken::new();

    let metadata = RequestDescriptor::get(cfg.metadata_path.clone()).in_scope(cfg.scope.clone());
    let ids = client
        .load_rate_limits(metadata, &cfg.scope, &cancel)
        .await?;
    info!("{} rate limit(s) registered for scope {}", ids.len(), cfg.scope);

    let weights = vec![
        QueryWeight::new(dimension_id(&cfg.scope, RateLimitKind::RequestWeight), opts.weight),
        QueryWeight::new(dimension_id(&cfg.scope, RateLimitKind::RawRequests), 1),
    ];
    for attempt in 1..=opts.repeat {
        let mut request = RequestDescriptor::get(opts.path.clone()).in_scope(cfg.scope.clone());
        if opts.signed {
            request = request.signed();
        }
        let query = client.prepare_json::<serde_json::Value>(request, weights.clone());
        let line = match query.execute(&cancel).await {
            Ok(body) => json!({ "attempt": attempt, "ok": true, "body": body }),
            Err(e) => {
                warn!("attempt {} failed: {}", attempt, e);
                json!({
                    "attempt": attempt,
                    "ok": false,
                    "error": { "kind": e.kind(), "code": e.code(), "message": e.to_string() }
                })
            }
        };
        println!("{}", line);
    }

    println!("{}", json!({ "limits": client.registry().limits() }));
    client.shutdown();
    Ok(())
}
