use relay::discovery::ConnectAction;
use relay::role::Role;
use relay::transport::{self, ClientRegistry, PeerConnectionSlot, SubscriberRegistry};
use relay::{config, db, http};
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load_config().expect("invalid configuration");

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let monitor_database_url =
        env::var("MONITOR_DATABASE_URL").unwrap_or_else(|_| database_url.clone());

    info!("connecting to database...");
    let database = db::DatabaseGateway::connect_lazy(&database_url, &monitor_database_url)
        .expect("failed to construct database gateway");
    database.run_migrations().await.expect("failed to run migrations");
    info!("migrations applied");

    let hostname = env::var("HOSTNAME").unwrap_or_else(|_| "relay".to_owned());
    let (mut app, inbound) = relay::Relay::new(&cfg, database, hostname, Role::Standby);

    app.sockets.bind_base().await.expect("failed to bind base sockets");
    let client_registry: ClientRegistry = Arc::new(Mutex::new(HashMap::new()));
    let peer_slot = PeerConnectionSlot::new();
    let log_subscribers = SubscriberRegistry::new();

    {
        let base = app.sockets.base().expect("base sockets just bound");
        transport::spawn_submission_acceptor(
            base.read_submission.clone(),
            inbound.read_tx.clone(),
            client_registry.clone(),
            "read_submission",
            None,
        );
        transport::spawn_peer_acceptor(base.peer.clone(), inbound.peer_tx.clone(), peer_slot.clone());
    }

    if !cfg.dont_promote {
        promote_sockets(&mut app, &inbound, &client_registry, &log_subscribers)
            .await
            .expect("failed to construct initial master sockets");
    }

    let telemetry_handle = http::TelemetryHandle::new();
    telemetry_handle.update(app.pipeline.telemetry().last_snapshot(), app.role.role()).await;
    telemetry_handle.set_ready(true).await;
    let metrics_router = http::build_router(telemetry_handle.clone());
    let metrics_listener = tokio::net::TcpListener::bind(cfg.metrics_bind_addr)
        .await
        .expect("failed to bind metrics listener");
    info!(addr = %cfg.metrics_bind_addr, "metrics endpoint listening");

    let mut reply_sink = transport::TcpReplySink::new(client_registry.clone());
    let mut log_sink = transport::LogPublicationSink::new(log_subscribers.clone());
    let mut peer_sink = transport::PeerBroadcastSink::new(peer_slot.clone());

    let pipeline_loop = async {
        loop {
            let transitions = app
                .pipeline
                .run_iteration(&mut app.role, &app.header, &mut reply_sink, &mut log_sink, &mut peer_sink)
                .await;
            for transition in transitions {
                match transition {
                    relay::role::Transition::PromotedToMaster => {
                        if let Err(e) = promote_sockets(&mut app, &inbound, &client_registry, &log_subscribers).await {
                            error!(error = %e, "failed to construct master sockets after promotion");
                        }
                    }
                    relay::role::Transition::DemotedToStandby => {
                        app.sockets.destroy_master_sockets();
                    }
                }
            }
            for action in app.discovery.drain_pending() {
                if let ConnectAction::Connect { socket_tag, endpoint, .. } = action {
                    if socket_tag == "peer" {
                        if let Ok(addr) = endpoint.parse() {
                            let peer_tx = inbound.peer_tx.clone();
                            let slot = peer_slot.clone();
                            tokio::spawn(async move {
                                if let Err(e) = transport::connect_outbound_peer(addr, peer_tx, slot).await {
                                    warn!(error = %e, "failed to dial peer");
                                }
                            });
                        }
                    }
                }
            }
            telemetry_handle
                .update(app.pipeline.telemetry().last_snapshot(), app.role.role())
                .await;
            tokio::time::sleep(cfg.inpoll_timeout).await;
        }
    };

    tokio::select! {
        result = axum::serve(metrics_listener, metrics_router).with_graceful_shutdown(shutdown_signal()) => {
            if let Err(e) = result {
                error!(error = %e, "metrics server exited with an error");
            }
        }
        _ = pipeline_loop => {}
        _ = shutdown_signal() => {}
    }

    drain_pending_replies(&mut app, &mut reply_sink, Duration::from_secs(5)).await;
    app.sockets.destroy_master_sockets();

    info!("relay shut down gracefully");
}

/// Spec §5 shutdown: stop accepting new work (the caller has already left
/// the select loop), flush whatever replies are still queued up to a
/// bounded deadline, then let the caller tear down the sockets. Any reply
/// still queued once the deadline passes is left for the client to retry.
async fn drain_pending_replies<S: relay::pipeline::ReplySink>(
    app: &mut relay::Relay,
    reply_sink: &mut S,
    deadline: Duration,
) {
    let start = tokio::time::Instant::now();
    let pending = app.pipeline.reply_queue_len();
    if pending == 0 {
        return;
    }
    info!(pending, "draining pending replies before shutdown");
    while app.pipeline.reply_queue_len() > 0 && start.elapsed() < deadline {
        app.pipeline.send_next_reply(reply_sink);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let remaining = app.pipeline.reply_queue_len();
    if remaining > 0 {
        warn!(remaining, "shutdown deadline reached with replies still queued");
    }
}

/// Construct the master-only sockets and spin up their accept loops —
/// shared by the startup path (when not `dont_promote`) and by a
/// self-promotion discovered mid-run.
async fn promote_sockets(
    app: &mut relay::Relay,
    inbound: &relay::pipeline::PipelineInbound,
    client_registry: &ClientRegistry,
    log_subscribers: &SubscriberRegistry,
) -> Result<(), relay::error::SocketError> {
    app.sockets.construct_master_sockets().await?;
    let master = app.sockets.master().expect("just constructed");
    transport::spawn_submission_acceptor(
        master.write_submission.clone(),
        inbound.write_tx.clone(),
        client_registry.clone(),
        "write_submission",
        Some(master.shutdown.clone()),
    );
    transport::spawn_log_acceptor(master.log_submission.clone(), inbound.log_tx.clone(), master.shutdown.clone());
    transport::spawn_log_publication_acceptor(
        master.log_publication.clone(),
        log_subscribers.clone(),
        master.shutdown.clone(),
    );
    Ok(())
}

/// Waits for SIGTERM or Ctrl-C and returns, unblocking the `select!` in
/// `main` so it can stop accepting new work; `drain_pending_replies` and
/// the socket teardown that follow are what actually implement spec §5's
/// shutdown sequence.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
