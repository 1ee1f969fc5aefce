//! Consistent-hash balancer entry point, fronting N gateway instances.

use llm_gateway::config::BalancerConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_gateway=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = BalancerConfig::from_env()?;
    llm_gateway::balancer::serve(config).await
}
