//! Host service: configuration, component wiring, the dispatch loop and
//! graceful stop.

pub mod config;

use std::sync::Arc;

use anyhow::Context;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use signalrtc_b2bua_core::{
    classify, B2buaConfig, B2buaCore, CallManager, CdrStore, DialplanEvaluator, DialplanStore,
    Dispatch, InviteJob, SipCallStore,
};
use signalrtc_registrar_core::{
    BindingStore, DigestAuthenticator, RegisterFailureReason, RegisterJob, RegistrarConfig,
    RegistrarCore, SubscribeJob, SubscriberCore,
};
use signalrtc_sbc_core::AbuseFilter;
use signalrtc_signal_relay::{ApiState, SignalStore};
use signalrtc_sip_transport::{
    response_for, transaction_key, TransportConfig, TransportEvent, TransportManager,
};
use signalrtc_users_core::{DirectoryStore, DomainRegistry, SqliteDirectoryStore};

pub use config::ServerConfig;

/// The assembled server: every long-lived component, owned here and passed
/// down by handle. No globals.
pub struct Server {
    config: ServerConfig,
    transport: Arc<TransportManager>,
    registrar: Arc<RegistrarCore>,
    subscriber: Arc<SubscriberCore>,
    b2bua: Arc<B2buaCore>,
    call_manager: Arc<CallManager>,
    abuse: AbuseFilter,
    cancel: CancellationToken,
}

impl Server {
    pub async fn build(config: ServerConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let cancel = CancellationToken::new();

        // Stores first: everything else hangs off the pool.
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(&config.database_url)
            .await
            .context("opening database")?;
        let directory = SqliteDirectoryStore::new(pool.clone())
            .await
            .context("preparing directory schema")?;

        // Seed the configured default domain so a fresh install can boot.
        if directory.list_domains().await?.is_empty() {
            if let Some(domain) = &config.sip_domain {
                info!(%domain, "seeding default domain");
                directory.create_domain(domain, &[]).await?;
            }
        }
        let domains = DomainRegistry::load(&directory)
            .await
            .context("loading domain registry (is the domain table seeded?)")?;
        let directory: Arc<dyn DirectoryStore> = Arc::new(directory);

        let registrar_config = RegistrarConfig {
            worker_count: config.worker_count,
            ..RegistrarConfig::default()
        };
        let bindings = Arc::new(
            BindingStore::new(pool.clone(), registrar_config.clone())
                .await
                .context("preparing binding schema")?,
        );
        let cdrs = CdrStore::new(pool.clone()).await?;
        let sip_calls = SipCallStore::new(pool.clone()).await?;
        let dialplans = DialplanStore::new(pool.clone()).await?;
        dialplans.seed_if_missing().await?;
        let evaluator = DialplanEvaluator::new(dialplans.clone());
        // Warm the dialplan so the first INVITE does not pay the compile.
        if let Err(err) = evaluator.refresh_if_stale().await {
            warn!(error = %err, "dialplan warmup failed, calls will 404 until fixed");
        }

        let transport = TransportManager::bind(TransportConfig {
            sip_port: config.sip_listen_port,
            sip_tls_port: config.sip_tls_listen_port,
            tls_cert_path: config.tls_cert_path.clone(),
            tls_key_path: config.tls_key_path.clone(),
            contact: config.contact_policy(),
        })
        .await
        .context("binding SIP listeners")?;

        // Abuse filter: configured subnets are exempt from all counting.
        let subnets = config.parsed_subnets();
        let abuse = AbuseFilter::new(if subnets.is_empty() {
            None
        } else {
            Some(Arc::new(move |ip| {
                subnets.iter().any(|subnet| subnet.contains(ip))
            }))
        });

        let authenticator = Arc::new(DigestAuthenticator::new());
        let registrar = RegistrarCore::new(
            registrar_config.clone(),
            transport.clone(),
            directory.clone(),
            domains.clone(),
            bindings.clone(),
            authenticator.clone(),
            cancel.clone(),
        );
        let subscriber = SubscriberCore::new(
            registrar_config,
            transport.clone(),
            directory.clone(),
            domains.clone(),
            authenticator.clone(),
            cancel.clone(),
        );
        let call_manager = CallManager::new(transport.clone(), cdrs, sip_calls);
        let b2bua = B2buaCore::new(
            B2buaConfig {
                worker_count: config.worker_count.min(4),
                ..B2buaConfig::default()
            },
            transport.clone(),
            directory.clone(),
            domains.clone(),
            evaluator.clone(),
            authenticator,
            call_manager.clone(),
            cancel.clone(),
        );

        // Failure hooks feed the abuse filter; both must stay non-blocking.
        {
            let filter = abuse.clone();
            registrar.on_register_failure(Arc::new(move |failure| {
                if matches!(
                    failure.reason,
                    RegisterFailureReason::DomainNotServiced | RegisterFailureReason::Forbidden
                ) {
                    filter.record_register_failure(failure.remote.ip(), failure.uri_host_is_ip);
                }
            }));
        }
        {
            let filter = abuse.clone();
            b2bua.on_accept_call_failure(Arc::new(move |failure| {
                filter.record_accept_failure(failure.remote.ip(), failure.uri_host_is_ip);
            }));
        }

        let _ = bindings.start_sweeper(cancel.clone());
        registrar.start();
        subscriber.start();
        b2bua.start();

        // HTTP surface: relay mailbox plus admin endpoints.
        let api_state = ApiState {
            signals: SignalStore::new(pool).await?,
            directory,
            domains,
            dialplans,
            evaluator,
        };
        let http_addr = config.http_listen_addr;
        let http_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = signalrtc_signal_relay::serve(http_addr, api_state, http_cancel).await
            {
                warn!(error = %err, "http surface exited");
            }
        });

        let server = Self {
            config,
            transport,
            registrar,
            subscriber,
            b2bua,
            call_manager,
            abuse,
            cancel,
        };
        server.spawn_dispatcher();
        Ok(server)
    }

    /// The dispatch loop: abuse gate, then classification into the cores.
    fn spawn_dispatcher(&self) {
        let mut events = self.transport.subscribe();
        let transport = self.transport.clone();
        let registrar = self.registrar.clone();
        let subscriber = self.subscriber.clone();
        let b2bua = self.b2bua.clone();
        let call_manager = self.call_manager.clone();
        let abuse = self.abuse.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "dispatcher lagged, events dropped");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                };

                let remote = event.remote();
                // Banned sources are dropped before any processing, with
                // no response on the wire.
                if let Some(reason) = abuse.is_banned(remote.ip()) {
                    debug!(%remote, %reason, "dropping traffic from banned source");
                    continue;
                }

                match event {
                    TransportEvent::RequestReceived {
                        request,
                        local,
                        remote,
                        transport: kind,
                    } => {
                        abuse.observe_message(
                            remote.ip(),
                            &transaction_key(&request.headers, true),
                            true,
                        );
                        match classify(&request) {
                            Dispatch::InDialog => {
                                if let Err(err) = call_manager
                                    .process_in_dialog(request, remote, kind)
                                    .await
                                {
                                    warn!(error = %err, "in-dialog processing failed");
                                }
                            }
                            Dispatch::Invite => {
                                b2bua
                                    .add_invite(InviteJob {
                                        request,
                                        local,
                                        remote,
                                        transport: kind,
                                    })
                                    .await;
                            }
                            Dispatch::Register => {
                                registrar
                                    .add_register(RegisterJob {
                                        request,
                                        local,
                                        remote,
                                        transport: kind,
                                    })
                                    .await;
                            }
                            Dispatch::Subscribe => {
                                subscriber
                                    .add_subscribe(SubscribeJob {
                                        request,
                                        local,
                                        remote,
                                        transport: kind,
                                    })
                                    .await;
                            }
                            Dispatch::Cancel => {
                                b2bua.cancel_invite(&request, remote, kind).await;
                            }
                            Dispatch::Options => {
                                let response = response_for(
                                    &request,
                                    rsip::StatusCode::OK,
                                    vec![rsip::Header::Allow(rsip::headers::Allow::from(
                                        "INVITE, ACK, BYE, CANCEL, OPTIONS, REGISTER, SUBSCRIBE, NOTIFY"
                                            .to_string(),
                                    ))],
                                );
                                if let Err(err) =
                                    transport.send_response(response, remote, kind).await
                                {
                                    debug!(error = %err, "options reply failed");
                                }
                            }
                            Dispatch::NotAllowed => {
                                let response = response_for(
                                    &request,
                                    rsip::StatusCode::MethodNotAllowed,
                                    vec![],
                                );
                                if let Err(err) =
                                    transport.send_response(response, remote, kind).await
                                {
                                    debug!(error = %err, "405 reply failed");
                                }
                            }
                        }
                    }
                    TransportEvent::ResponseReceived { response, remote, .. } => {
                        abuse.observe_message(
                            remote.ip(),
                            &transaction_key(&response.headers, false),
                            false,
                        );
                        if let Err(err) = call_manager.handle_response(response).await {
                            warn!(error = %err, "response routing failed");
                        }
                    }
                }
            }
            debug!("dispatcher stopped");
        });
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn abuse_filter(&self) -> &AbuseFilter {
        &self.abuse
    }

    /// Block until shutdown is requested.
    pub async fn run(&self) {
        self.cancel.cancelled().await;
    }

    /// Signal every worker and listener to stop. Queued requests drain;
    /// outstanding transactions complete naturally.
    pub fn shutdown(&self) {
        info!("shutting down");
        self.registrar.stop();
        self.subscriber.stop();
        self.b2bua.stop();
        self.cancel.cancel();
        self.transport.shutdown();
    }
}
