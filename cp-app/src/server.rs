//! chatpace runtime.
//!
//! Wires the bridge channel, the inbound gateway, the dispatcher and the
//! engagement scheduler together, and mounts the control routes on top.

use crate::commands::LocalCommands;
use crate::config::{ChatpaceConfig, expand_home};
use crate::delivery::DeliveryPipeline;
use crate::dispatcher::Dispatcher;
use crate::engagement::EngagementScheduler;
use crate::gate::SendGate;
use crate::gateway::Gateway;
use crate::intent::{IntentClassifier, KeywordIntentClassifier};
use crate::queue::ConversationQueue;
use crate::responder::{LlmResponder, ReplyPolicy, Responder};
use crate::routes;
use crate::stickers::StickerLexicon;
use crate::store::{ConversationLog, SqliteStore};
use crate::vision::{ImageDescriber, LlmImageDescriber};
use anyhow::Result;
use axum::Extension;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use cp_channels::{ChannelAdapter, HttpBridgeAdapter, InboundEvent};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const INBOUND_BUFFER: usize = 1024;
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ChatpaceState {
    pub channel_id: String,
    pub queue: Arc<ConversationQueue>,
    pub gate: Arc<SendGate>,
    pub gateway: Arc<Gateway>,
    pub engagement: Option<Arc<EngagementScheduler>>,
    pub inbound_tx: mpsc::Sender<InboundEvent>,
    /// Fallback index for pushed events that carry no id.
    pub pushed_events: AtomicUsize,
    pub started_at: Instant,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = ChatpaceConfig::load_with_path(config_path).await?;
    let db_path = expand_home(&cfg.storage.db_path)?;
    let store = SqliteStore::open(&db_path)?;
    let bind_addr = parse_bind_addr(&cfg)?;
    tracing::info!(
        config_path = %path.display(),
        bot_name = %cfg.general.bot_name,
        model = %cfg.llm.default.model,
        api_key_configured = !cfg.llm.default.api_key.trim().is_empty(),
        vision_model = %cfg.vision_profile().model,
        intents = cfg.intents.len(),
        channel_id = %cfg.channel.id,
        polling = cfg.channel.poll_url.is_some(),
        db_path = %store.path().display(),
        server_enabled = cfg.server.enabled,
        %bind_addr,
        "config ok"
    );
    Ok(())
}

pub async fn send_one_shot(config_path: Option<PathBuf>, recipient: &str, message: &str) -> Result<()> {
    let cfg = ChatpaceConfig::load(config_path).await?;
    let adapter = build_channel(&cfg)?;
    adapter.send_text(recipient, message).await?;
    tracing::info!(channel_id = %cfg.channel.id, %recipient, "one-shot message sent");
    Ok(())
}

fn build_channel(cfg: &ChatpaceConfig) -> Result<HttpBridgeAdapter> {
    let channel = &cfg.channel;
    Ok(HttpBridgeAdapter::new(channel.id.trim(), &channel.send_url)?
        .with_poll_url(channel.poll_url.clone())?
        .with_attachment_url(channel.attachment_url.clone())?
        .with_auth_token(channel.auth_token.clone())
        .with_poll_interval(Duration::from_millis(channel.poll_interval_ms))
        .with_start_from_latest(channel.start_from_latest))
}

fn parse_bind_addr(cfg: &ChatpaceConfig) -> Result<SocketAddr> {
    cfg.server
        .bind_addr
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid server.bind_addr {:?}: {e}", cfg.server.bind_addr))
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let started_at = Instant::now();
    let (cfg, path) = ChatpaceConfig::load_with_path(config_path).await?;
    tracing::info!(
        config_path = %path.display(),
        bot_name = %cfg.general.bot_name,
        model = %cfg.llm.default.model,
        intents = cfg.intents.len(),
        channel_id = %cfg.channel.id,
        queue_idle_threshold_ms = cfg.queue.idle_threshold_ms,
        queue_scan_interval_ms = cfg.queue.scan_interval_ms,
        queue_max_fragments = cfg.queue.max_fragments,
        debounce_coalesce_delay_ms = cfg.debounce.coalesce_delay_ms,
        vision_enabled = cfg.vision.enabled,
        engagement_enabled = cfg.engagement.enabled,
        stickers_enabled = cfg.stickers.enabled,
        commands_enabled = cfg.commands.enabled,
        server_enabled = cfg.server.enabled,
        "server configuration loaded"
    );
    let listener = if cfg.server.enabled {
        Some(preflight_bind_listener(parse_bind_addr(&cfg)?).await?)
    } else {
        None
    };

    let store = SqliteStore::open(&expand_home(&cfg.storage.db_path)?)?;
    let log: Arc<dyn ConversationLog> = Arc::new(store.clone());
    let commands = cfg
        .commands
        .enabled
        .then(|| LocalCommands::new(cfg.commands.clone(), store.clone()));

    let channel: Arc<dyn ChannelAdapter> = Arc::new(build_channel(&cfg)?);
    let responder: Arc<dyn Responder> =
        Arc::new(LlmResponder::new(&cfg, log.clone(), commands.clone())?);
    let classifier: Arc<dyn IntentClassifier> = Arc::new(KeywordIntentClassifier::new(&cfg.intents));
    let policy = ReplyPolicy::from_config(&cfg.responder);

    let mut delivery = DeliveryPipeline::new(channel.clone(), log, cfg.delivery.clone());
    if cfg.stickers.enabled {
        let dir = expand_home(&cfg.stickers.dir)?;
        tracing::info!(sticker_dir = %dir.display(), "sticker replies enabled");
        delivery = delivery.with_stickers(StickerLexicon::new(&cfg.stickers), dir);
    }
    let delivery = Arc::new(delivery);

    let queue = Arc::new(ConversationQueue::new(cfg.queue.max_fragments));
    let gate = SendGate::new();
    let shutdown = CancellationToken::new();
    let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    let dispatcher = Arc::new(Dispatcher::new(
        &cfg.queue,
        queue.clone(),
        gate.clone(),
        classifier.clone(),
        responder.clone(),
        policy.clone(),
        delivery.clone(),
    ));
    handles.push(("dispatcher", dispatcher.spawn(shutdown.child_token())));

    let engagement = if cfg.engagement.enabled {
        let scheduler = Arc::new(EngagementScheduler::new(
            &cfg.engagement,
            gate.clone(),
            responder,
            policy,
            delivery,
        )?);
        scheduler.seed(&cfg.engagement);
        handles.push(("engagement", scheduler.clone().spawn(shutdown.child_token())));
        Some(scheduler)
    } else {
        None
    };

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
    let mut gateway = Gateway::new(&cfg, queue.clone(), gate.clone(), classifier, inbound_rx);
    if let Some(commands) = commands {
        gateway = gateway.with_commands(commands);
    }
    if cfg.vision.enabled {
        let describer: Arc<dyn ImageDescriber> = Arc::new(LlmImageDescriber::new(
            cfg.vision_profile().client(),
            cfg.vision.clone(),
        ));
        gateway = gateway.with_describer(describer);
    }
    if let Some(engagement) = &engagement {
        gateway = gateway.with_engagement(engagement.clone());
    }
    let gateway = Arc::new(gateway);
    {
        let gateway = gateway.clone();
        let token = shutdown.child_token();
        handles.push(("gateway", tokio::spawn(async move { gateway.run(token).await })));
    }

    channel.start(inbound_tx.clone()).await?;
    tracing::info!(channel_id = %channel.channel_id(), "channel started");

    match listener {
        Some(listener) => {
            let state = Arc::new(ChatpaceState {
                channel_id: cfg.channel.id.trim().to_string(),
                queue,
                gate,
                gateway,
                engagement,
                inbound_tx,
                pushed_events: AtomicUsize::new(0),
                started_at,
            });
            let app = build_app(&cfg, state);
            let addr = listener.local_addr()?;
            tracing::info!(%addr, "chatpace serving");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
                .await?;
            tracing::info!("http server shutdown completed");
        }
        None => {
            // Keep the sender alive so the gateway loop only ends on shutdown.
            let _inbound_tx = inbound_tx;
            tracing::info!("chatpace running without control server");
            shutdown_signal(shutdown.clone()).await;
        }
    }

    shutdown.cancel();
    for (name, handle) in handles {
        match tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, handle).await {
            Ok(Ok(())) => tracing::info!(task = name, "background task stopped"),
            Ok(Err(e)) => tracing::warn!(task = name, error = %e, "background task join failed"),
            Err(_) => tracing::warn!(task = name, "timed out waiting for background task shutdown"),
        }
    }

    Ok(())
}

fn build_app(cfg: &ChatpaceConfig, state: Arc<ChatpaceState>) -> axum::Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::debug!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Builds route state backed by in-memory parts, returning the receiver the
    /// gateway would normally own.
    pub fn state() -> (Arc<ChatpaceState>, mpsc::Receiver<InboundEvent>) {
        let cfg = ChatpaceConfig::from_toml_str("[general]\nbot_name = \"pace\"\n")
            .expect("minimal config");
        let queue = Arc::new(ConversationQueue::new(cfg.queue.max_fragments));
        let gate = SendGate::new();
        let (_gateway_tx, gateway_rx) = mpsc::channel(1);
        let gateway = Arc::new(Gateway::new(
            &cfg,
            queue.clone(),
            gate.clone(),
            Arc::new(KeywordIntentClassifier::default()),
            gateway_rx,
        ));
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let state = Arc::new(ChatpaceState {
            channel_id: "bridge".to_string(),
            queue,
            gate,
            gateway,
            engagement: None,
            inbound_tx,
            pushed_events: AtomicUsize::new(0),
            started_at: Instant::now(),
        });
        (state, inbound_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_defaults_to_missing() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_id_from_headers(&headers), "missing");
        headers.insert("x-request-id", "abc".parse().expect("header value"));
        assert_eq!(request_id_from_headers(&headers), "abc");
    }

    #[test]
    fn bind_addr_must_be_a_socket_address() {
        let mut cfg = ChatpaceConfig::from_toml_str("[general]\nbot_name = \"pace\"\n")
            .expect("minimal config");
        assert_eq!(
            parse_bind_addr(&cfg).expect("default addr"),
            "127.0.0.1:3030".parse::<SocketAddr>().expect("addr")
        );
        cfg.server.bind_addr = "localhost".to_string();
        assert!(parse_bind_addr(&cfg).is_err());
    }

    #[test]
    fn channel_builds_from_default_config() {
        let cfg = ChatpaceConfig::from_toml_str("[general]\nbot_name = \"pace\"\n")
            .expect("minimal config");
        let channel = build_channel(&cfg).expect("bridge adapter");
        assert_eq!(channel.channel_id(), "wechat-bridge");
    }
}
