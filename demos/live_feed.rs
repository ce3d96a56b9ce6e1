//! Signs in, prints the first page of posts, then follows live updates for
//! them until Ctrl-C.
//!
//! ```text
//! LINKBOARD_USER=ada LINKBOARD_PASSWORD=secret cargo run --example live_feed
//! ```

use linkboard_client::prelude::*;
use linkboard_client::realtime::{handler, topics};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("live_feed=info".parse()?)
                .add_directive("linkboard_client=info".parse()?),
        )
        .init();

    let config = ClientConfig::load()?;
    let username = std::env::var("LINKBOARD_USER").unwrap_or_else(|_| "ada".to_string());
    let password = std::env::var("LINKBOARD_PASSWORD").unwrap_or_else(|_| "secret".to_string());

    let coordinator = TokenCoordinator::new(&config)?;
    let session = coordinator
        .login(&Credentials::new(username, password))
        .await?;
    info!(user = %session.user.username, "Signed in.");

    let api = ApiClient::new(coordinator.clone());
    let posts = api.list_posts(None, &PageRequest::default()).await?;
    for post in &posts.content {
        println!("[{:>4}] {} (by {})", post.score, post.title, post.author_username);
    }

    let realtime = RealtimeManager::over_websocket(&config.realtime, coordinator.session());
    let _follower = realtime.follow_session();
    realtime.connect().await?;

    let (updates, mut received) = handler::channel();
    for post in &posts.content {
        if !realtime.subscribe(topics::post(post.id), updates.clone()) {
            warn!(post = post.id, "Could not follow post.");
        }
    }
    let mut state = realtime.watch_state();

    loop {
        tokio::select! {
            Some((topic, event)) = received.recv() => {
                println!("{topic}: {} {event:?}", event.kind_name());
            }
            Ok(()) = state.changed() => {
                info!(state = %*state.borrow(), "Realtime connection changed.");
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    realtime.disconnect();
    coordinator.logout();
    Ok(())
}
