use std::{sync::Arc, time::Duration};

use clap::Parser;
use solver_relay::{dto::EventKind, WsRelayClient};
use tracing::{info, warn};

use crate::{
    http,
    ledger::{Ledger, NearLedger},
    pricing,
    quoter::{Quoter, QuoterConfig, DEFAULT_GRACE_MS, DEFAULT_MAX_DEADLINE_MS},
    reserves::ReserveStore,
};

/// Intents Solver - a market making solver for the intents relay
///
/// Connects to the relay, prices incoming quote requests for a two asset
/// pair against its on-ledger reserves, and publishes signed quotes back.
#[derive(Parser, Debug, Clone, PartialEq)]
#[clap(version = env!("CARGO_PKG_VERSION"))]
struct CliArgs {
    /// Relay websocket URL.
    #[clap(long, default_value = "wss://solver-relay.chaindefuser.com/ws", env = "RELAY_WS_URL")]
    relay_ws_url: String,

    /// Relay API key, sent as the authorization header during the websocket
    /// handshake. Can be set with the RELAY_AUTH_KEY env variable.
    #[clap(short = 'k', long, env = "RELAY_AUTH_KEY")]
    relay_auth_key: Option<String>,

    /// Ledger JSON-RPC endpoint. Pass the flag multiple times (or a comma
    /// separated list) to require byte identical answers from every endpoint.
    #[clap(
        long,
        env = "LEDGER_RPC_URLS",
        value_delimiter = ',',
        default_value = "https://rpc.mainnet.near.org"
    )]
    ledger_rpc_url: Vec<String>,

    /// The ledger account this solver quotes and signs as.
    #[clap(long, env = "SOLVER_ACCOUNT_ID")]
    account_id: String,

    /// The solver's secret key in ed25519:<base58> format.
    #[clap(long, env = "SOLVER_PRIVATE_KEY", hide_env_values = true)]
    private_key: String,

    /// Verifier contract the signed intents are addressed to and which holds
    /// the solver's reserves.
    #[clap(long, default_value = "intents.near", env = "INTENTS_CONTRACT")]
    intents_contract: String,

    /// First asset id of the quoted pair.
    #[clap(long, env = "TOKEN1")]
    token1: String,

    /// Second asset id of the quoted pair.
    #[clap(long, env = "TOKEN2")]
    token2: String,

    /// Solver margin in percent, e.g. 0.3 for 30 basis points.
    #[clap(long, default_value = "0.3", env = "MARGIN_PERCENT")]
    margin_percent: f64,

    /// Seconds between periodic reserve refreshes.
    #[clap(long, default_value = "15", env = "REFRESH_INTERVAL_SECS")]
    refresh_interval_secs: u64,

    /// Port for the liveness endpoint.
    #[clap(long, default_value = "3000", env = "PORT")]
    port: u16,

    /// Enable verbose logging. This will show per-request detail about quote
    /// pricing and any drops that occur.
    #[clap(long)]
    verbose: bool,
}

impl CliArgs {
    fn validate(&self) -> Result<(), String> {
        if !(self.margin_percent > 0.0 && self.margin_percent < 100.0) {
            return Err("margin_percent must be between 0 and 100 exclusive".to_string());
        }
        if self.token1 == self.token2 {
            return Err("token1 and token2 must be different assets".to_string());
        }
        if self.refresh_interval_secs == 0 {
            return Err("refresh_interval_secs must be positive".to_string());
        }
        Ok(())
    }
}

pub async fn run_cli() -> Result<(), String> {
    let args: CliArgs = CliArgs::parse();
    args.validate()?;

    let log_level = if args.verbose { "debug" } else { "info" };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("Failed to set up logging subscriber: {e}"))?;

    run(args).await
}

async fn run(args: CliArgs) -> Result<(), String> {
    info!("Running with version: {}", option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"));

    let ledger: Arc<dyn Ledger> = Arc::new(
        NearLedger::new(
            &args.ledger_rpc_url,
            &args.account_id,
            &args.intents_contract,
            &args.private_key,
        )
        .map_err(|e| format!("Failed to create ledger gateway: {e}"))?,
    );
    if args.ledger_rpc_url.len() > 1 {
        info!(endpoints = args.ledger_rpc_url.len(), "Quorum reads enabled");
    }

    let store = ReserveStore::new(ledger.clone(), vec![args.token1.clone(), args.token2.clone()]);
    // A failed first read is not fatal, quoting stays off until a later
    // refresh succeeds.
    if let Err(e) = store.refresh().await {
        warn!(error = %e, "Initial reserve load failed, starting without a snapshot");
    }

    let mut relay = WsRelayClient::new(&args.relay_ws_url, args.relay_auth_key.as_deref())
        .map_err(|e| format!("Failed to create relay client: {e}"))?;
    let quote_events = relay.register(EventKind::Quote);
    let fill_events = relay.register(EventKind::QuoteStatus);
    let ws_jh = relay
        .connect()
        .await
        .map_err(|e| format!("Relay client connection error: {e}"))?;

    let quoter = Arc::new(Quoter::new(
        QuoterConfig {
            margin_bps: pricing::margin_bps_from_percent(args.margin_percent),
            max_deadline_ms: DEFAULT_MAX_DEADLINE_MS,
            grace_ms: DEFAULT_GRACE_MS,
            recipient: args.intents_contract.clone(),
        },
        store.clone(),
        ledger,
        Arc::new(relay.clone()),
    ));
    let quote_jh = tokio::spawn(quoter.clone().run_quote_loop(quote_events));
    let fill_jh = tokio::spawn(quoter.run_fill_loop(fill_events));

    let refresh_store = store.clone();
    let refresh_jh = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(args.refresh_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = refresh_store.refresh().await {
                warn!(error = %e, "Periodic reserve refresh failed");
            }
        }
    });

    let server = http::serve(store, args.port)
        .map_err(|e| format!("Failed to bind liveness endpoint: {e}"))?;
    let server_jh = tokio::spawn(server);

    let (failed_task, shutdown_reason) = tokio::select! {
        res = ws_jh => ("Relay", extract_nested_error(res)),
        res = quote_jh => ("QuoteLoop", res.err().map(|e| e.to_string())),
        res = fill_jh => ("FillLoop", res.err().map(|e| e.to_string())),
        res = refresh_jh => ("ReserveRefresh", res.err().map(|e| e.to_string())),
        res = server_jh => ("LivenessEndpoint", extract_nested_error(res)),
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            if let Err(e) = relay.close().await {
                warn!(error = %e, "Relay client was already closed");
            }
            return Ok(());
        }
    };

    Err(format!(
        "{failed_task} task terminated: {}",
        shutdown_reason.unwrap_or("unknown reason".to_string())
    ))
}

#[inline]
fn extract_nested_error<T, E1: ToString, E2: ToString>(
    res: Result<Result<T, E1>, E2>,
) -> Option<String> {
    res.map_err(|e| e.to_string())
        .and_then(|r| r.map_err(|e| e.to_string()))
        .err()
}
