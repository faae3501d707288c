//! Entry point: load CLI/config flags, wire up stores and gateway adapters,
//! and hand off to the accept loop.

use std::collections::HashSet;
use std::sync::Arc;

use payproc_tokio::NotifyOnce;
use payprocd::account::AccountStore;
use payprocd::cli::Args;
use payprocd::config;
use payprocd::context::{Config, Context};
use payprocd::daemon;
use payprocd::gateway::paypal::PaypalClient;
use payprocd::gateway::stripe::StripeClient;
use payprocd::gateway::build_http_client;
use payprocd::journal::Journal;
use payprocd::preorder::PreorderStore;
use anyhow::Context as _;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = config::load_args()?;
    init_logging(&args);

    let database_key = args.database_key.as_deref().context("--database-key is required")?;
    let keys = payproc_crypto::Keys::load_from_files(database_key, args.backoffice_key.as_deref())?;

    let db_dir = args.db_dir();
    std::fs::create_dir_all(&db_dir)?;
    let preorders = PreorderStore::open(&format!("{db_dir}/preorder.db"))?;
    let accounts = AccountStore::open(&format!("{db_dir}/account.db"))?;
    let journal = Journal::new(
        args.journal_basename.clone().unwrap_or_else(|| format!("{db_dir}/journal")),
    );

    let http = build_http_client();
    let stripe = StripeClient::new(http.clone(), args.stripe_secret_key.clone().unwrap_or_default());
    let paypal = PaypalClient::new(
        http,
        args.paypal_client_id.clone().unwrap_or_default(),
        args.paypal_client_secret.clone().unwrap_or_default(),
        args.paypal_sandbox,
        args.paypal_receiver_email.clone().unwrap_or_default(),
        Arc::new(payproc_api_core::clock::SystemClock),
    );

    let config = Config {
        allow_uid: args.allow_uid.iter().copied().collect::<HashSet<u32>>(),
        admin_uid: args.admin_uid.iter().copied().collect::<HashSet<u32>>(),
        live: !args.test_mode,
    };

    let shutdown = NotifyOnce::new();
    let ctx = Arc::new(Context::new(config, preorders, accounts, journal, stripe, paypal, keys, shutdown));

    daemon::run(ctx, &args.socket_path()).await
}

fn init_logging(args: &Args) {
    let filter = args
        .log_level
        .clone()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
