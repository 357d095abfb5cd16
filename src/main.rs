//! Voice-to-agent relay server binary.

use voice_relay::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // INFO level by default, RUST_LOG overrides.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    cli::run().await
}
