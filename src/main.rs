use bastion::{Bastion, BastionConfig};
use tracing::error;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    if let Err(e) = run().await {
        error!(error = %e, "bastion stopped");
        return Err(e);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let config = BastionConfig::parse()?;
    let host_key = config.listen.load_host_key()?;
    let bastion = Bastion::bind(config, host_key).await?;
    bastion.run().await?;
    Ok(())
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
}
