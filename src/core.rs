use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::dispatcher::Dispatcher;
use crate::gateway::{self, OneBotGateway};
use crate::humanizer::EmojiSystem;
use crate::providers::OpenAiCompatibleClient;
use crate::rate_limit::RateLimiter;
use crate::skills::SkillRegistry;
use crate::store::SqliteStore;
use crate::traits::{BotGateway, LlmClient};

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);

    // 1. Store
    let store = Arc::new(SqliteStore::new(&config.db_path).await?);
    info!("Store initialized ({})", config.db_path);

    // 2. Model client
    let llm: Arc<dyn LlmClient> = Arc::new(OpenAiCompatibleClient::new(
        &config.api_url,
        &config.api_key,
    )?);
    info!(model = %config.model, working_model = %config.working_model(), "Model client ready");

    // 3. Bot gateway
    let bot_gateway: Arc<dyn BotGateway> = Arc::new(OneBotGateway::new(&config.onebot)?);
    info!(api_url = %config.onebot.api_url, "Gateway client ready");

    // 4. Registries and periodic sweeps
    let skills = Arc::new(SkillRegistry::new());
    skills.spawn_sweep();
    let rate = Arc::new(RateLimiter::new(config.rate_limit.clone()));
    rate.spawn_cleanup();

    // 5. Emoji system (directory scan runs detached; a slow multimodal
    // tagger must not delay startup)
    let emoji = Arc::new(EmojiSystem::new(
        llm.clone(),
        store.clone(),
        config.emoji.clone(),
        config.working_model().to_string(),
        config.is_multimodal,
    ));
    {
        let emoji = Arc::clone(&emoji);
        tokio::spawn(async move {
            if let Err(e) = emoji.bootstrap().await {
                warn!(error = %e, "emoji bootstrap failed");
            }
        });
    }

    // 6. Dispatcher
    let dispatcher = Dispatcher::new(
        config.clone(),
        store,
        bot_gateway,
        llm,
        skills,
        rate,
        emoji,
    );

    // 7. Event intake
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let listen_addr = config.onebot.listen_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = gateway::serve_events(&listen_addr, tx).await {
            error!(error = %e, "event webhook exited");
        }
    });

    info!(nicknames = ?config.nicknames, "banter is up");
    dispatcher.run(rx).await;
    Ok(())
}
