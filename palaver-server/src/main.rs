use palaver_server::{router, State};
use std::env;
use std::net::SocketAddr;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let mut port = 8000;
    if let Some(p) = env::args().nth(1) {
        port = p.parse()?;
    }
    let state = State::open(format!("palaver{port}"))?;
    let app = router(state);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("listening on {addr}");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
