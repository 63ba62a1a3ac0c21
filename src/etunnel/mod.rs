pub mod acceptor;
pub mod app;
pub mod config;
pub mod logging;
pub mod net;
pub mod registry;
pub mod relay;

pub async fn run(cfg: config::Config) -> anyhow::Result<()> {
    app::run(cfg).await
}
