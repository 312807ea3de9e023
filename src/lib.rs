//! Relay: a replicated, queue-buffered bridge between many client
//! processes and a backing Postgres database.
//!
//! [`Relay`] is the one owning object spec §9 calls for: it holds the
//! pipeline, the role controller, and the socket lifecycle, and mediates
//! between them so neither 4.G nor 4.H needs a back-reference to the
//! other.

pub mod cache;
pub mod codec;
pub mod config;
pub mod db;
pub mod discovery;
pub mod error;
pub mod http;
pub mod model;
pub mod pipeline;
pub mod queue;
pub mod role;
pub mod sockets;
pub mod telemetry;
pub mod transport;

use pipeline::{Pipeline, PipelineConfig, PipelineInbound};
use role::{Role, RoleController, RoleTimers};
use sockets::{SocketConfig, SocketLifecycle};

/// The relay instance: owns the pipeline, the role controller, and the
/// socket lifecycle, and is the only object that calls into more than one
/// of them (spec §9: "model as one owning object... avoid bidirectional
/// ownership").
pub struct Relay {
    pub pipeline: Pipeline,
    pub role: RoleController,
    pub sockets: SocketLifecycle,
    pub discovery: discovery::DiscoveryAdapter,
    pub header: String,
}

impl Relay {
    pub fn new(
        config: &config::RelayConfig,
        database: db::DatabaseGateway,
        header: impl Into<String>,
        initial_role: Role,
    ) -> (Self, PipelineInbound) {
        let (pipeline, inbound) = Pipeline::new(
            PipelineConfig {
                max_send_attempts: config.max_send_attempts,
                warn_limit: config.warn_limit,
                drop_limit: config.drop_limit,
                handle_unexpected_writes: config.handle_unexpected_writes,
                cache_period: config.cache_period,
                stats_period: config.stats_period,
            },
            database,
        );
        let role = RoleController::new(
            initial_role,
            RoleTimers {
                broadcast_period: config.broadcast_period,
                promote_timeout: config.promote_timeout,
                negotiation_timeout: config.negotiation_timeout,
                mm_warn_timeout: config.mm_warn_timeout,
            },
            config.dont_promote,
            config.warn_no_standby,
        );
        let sockets = SocketLifecycle::new(SocketConfig {
            bind_addr: config.bind_addr,
            clt_sub_port: config.clt_sub_port,
            log_sub_port: config.log_sub_port,
            log_pub_port: config.log_pub_port,
            mm_snd_port: config.mm_snd_port,
        });
        let relay = Relay {
            pipeline,
            role,
            sockets,
            discovery: discovery::DiscoveryAdapter::new(),
            header: header.into(),
        };
        (relay, inbound)
    }

    /// React to a role transition reported by the pipeline: construct or
    /// tear down the master-only sockets (spec §4.G / §4.H).
    pub async fn apply_transition(&mut self, transition: role::Transition) -> Result<(), error::SocketError> {
        match transition {
            role::Transition::PromotedToMaster => self.sockets.construct_master_sockets().await,
            role::Transition::DemotedToStandby => {
                self.sockets.destroy_master_sockets();
                Ok(())
            }
        }
    }
}
