//! Process wiring: every component is built once from the configuration

use axum::Router;
use std::sync::Arc;
use tracing::info;

use crate::core::config::GatewayConfig;
use crate::core::errors::Result;
use crate::core::rate_limiter::KeyedRateLimiter;
use crate::fanout::EventFanout;
use crate::generation::{InMemoryRepository, Orchestrator};
use crate::llm::backend_from_config;
use crate::server::api::{self, AppState};

/// Assembled gateway
#[derive(Debug, Clone)]
pub struct Gateway {
    pub config: GatewayConfig,
    pub orchestrator: Orchestrator,
    client_limiter: Arc<KeyedRateLimiter>,
}

impl Gateway {
    /// Build backend, limiter, repository and fan-out from `config`
    pub fn from_config(config: GatewayConfig) -> Result<Self> {
        let backend = backend_from_config(&config)?;
        let limiter = Arc::new(KeyedRateLimiter::new(
            config.rate_limit_rps,
            config.rate_limit_burst,
        )?);
        let client_limiter = Arc::new(KeyedRateLimiter::new(
            config.client_rate_limit_rps,
            config.client_rate_limit_burst,
        )?);
        let repository = Arc::new(InMemoryRepository::new(config.daily_token_limit));
        let fanout = EventFanout::from_config(&config);

        info!(
            backend = backend.kind(),
            bus = fanout.bus().kind(),
            rate_limit_rps = config.rate_limit_rps,
            rate_limit_burst = config.rate_limit_burst,
            client_rate_limit_rps = config.client_rate_limit_rps,
            daily_token_limit = config.daily_token_limit,
            "Gateway assembled"
        );

        let orchestrator = Orchestrator::new(
            backend,
            limiter,
            repository,
            fanout,
            config.request_defaults(),
        );

        Ok(Self {
            config,
            orchestrator,
            client_limiter,
        })
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(
            self.orchestrator.clone(),
            self.config.health_timeout(),
            self.client_limiter.clone(),
        )
    }

    /// HTTP router over this gateway
    pub fn router(&self) -> Router {
        api::router(self.app_state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_gateway_from_defaults() {
        let gateway = Gateway::from_config(GatewayConfig::default()).unwrap();
        assert_eq!(gateway.orchestrator.backend().kind(), "stub");
        assert_eq!(gateway.orchestrator.fanout().bus().kind(), "memory");
    }

    #[test]
    fn test_invalid_limiter_settings_fail() {
        let config = GatewayConfig {
            rate_limit_burst: 0,
            ..Default::default()
        };
        assert!(Gateway::from_config(config).is_err());

        let config = GatewayConfig {
            client_rate_limit_rps: 0.0,
            ..Default::default()
        };
        assert!(Gateway::from_config(config).is_err());
    }
}
