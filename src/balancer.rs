//! Combines endpoint selection with channel reuse.

use crate::channel::{self, ChannelPool, SharedChannelFactory};
use crate::endpoint::{self, Endpoint, EndpointPool, NodeId};
use crate::executor::RetryHooks;
use crate::policy::EndpointConfig;
use crate::status::Failure;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Endpoint(#[from] endpoint::Error),

    #[error(transparent)]
    Channel(#[from] channel::Error),
}

/// Routes calls to endpoints, over one shared channel per endpoint.
pub struct Balancer<C: Send + Sync + 'static> {
    endpoints: EndpointPool,
    channels: ChannelPool<C>,

    // Set once too many endpoints are pessimized, cleared by the next
    // discovery.
    discovery_wanted: AtomicBool,
}

impl<C: Send + Sync + 'static> Balancer<C> {
    pub fn new(config: EndpointConfig, factory: SharedChannelFactory<C>) -> Self {
        let shutdown_timeout = config.channel_shutdown_timeout;
        Self {
            endpoints: EndpointPool::new(config),
            channels: ChannelPool::new(factory, shutdown_timeout),
            discovery_wanted: AtomicBool::new(false),
        }
    }

    pub fn endpoints(&self) -> &EndpointPool {
        &self.endpoints
    }

    pub fn channels(&self) -> &ChannelPool<C> {
        &self.channels
    }

    /// Applies the result of a topology discovery.
    ///
    /// Channels of endpoints which disappeared are shut down.
    #[instrument(skip_all, name = "Balancer::apply_discovery")]
    pub async fn apply_discovery(&self, endpoints: impl IntoIterator<Item = Endpoint>) {
        let removed = self.endpoints.reset(endpoints);
        self.discovery_wanted.store(false, Ordering::Release);
        if !removed.is_empty() {
            self.channels
                .remove_channels(removed.iter().map(Endpoint::address))
                .await;
        }
    }

    /// Picks an endpoint, preferring `node_id`, and returns its channel.
    pub async fn route(&self, node_id: Option<NodeId>) -> Result<(Endpoint, Arc<C>), Error> {
        let endpoint = self.endpoints.get_endpoint(node_id)?;
        let channel = self.channels.get_channel(&endpoint.address()).await?;
        Ok((endpoint, channel))
    }

    /// Pessimizes an endpoint and drops its channel, so the next call to it
    /// reconnects.
    ///
    /// Returns true if the topology should be rediscovered.
    pub async fn pessimize(&self, endpoint: &Endpoint) -> bool {
        let needs_discovery = self.endpoints.pessimize(endpoint);
        if needs_discovery {
            event!(Level::WARN, "Most endpoints are pessimized; discovery wanted");
            self.discovery_wanted.store(true, Ordering::Release);
        }
        self.channels.remove_channels([endpoint.address()]).await;
        needs_discovery
    }

    /// Returns true if enough endpoints failed that the caller should run
    /// discovery and call [Self::apply_discovery].
    pub fn needs_discovery(&self) -> bool {
        self.discovery_wanted.load(Ordering::Acquire)
    }

    /// Shuts down every channel.
    pub async fn dispose(&self) {
        self.channels.dispose_all().await;
    }

    /// Returns a router which remembers the endpoint of the latest call, so
    /// a failed attempt's transport can be reset by a retry.
    pub fn tracker(&self) -> RouteTracker<'_, C> {
        RouteTracker {
            balancer: self,
            last: Mutex::new(None),
        }
    }
}

/// Routes the attempts of a single operation, and resets the transport of
/// the latest one when a retry asks for it.
pub struct RouteTracker<'a, C: Send + Sync + 'static> {
    balancer: &'a Balancer<C>,
    last: Mutex<Option<Endpoint>>,
}

impl<'a, C: Send + Sync + 'static> RouteTracker<'a, C> {
    pub async fn route(&self, node_id: Option<NodeId>) -> Result<(Endpoint, Arc<C>), Error> {
        let (endpoint, channel) = self.balancer.route(node_id).await?;
        *self.last.lock().unwrap() = Some(endpoint.clone());
        Ok((endpoint, channel))
    }
}

#[async_trait]
impl<'a, C: Send + Sync + 'static> RetryHooks for RouteTracker<'a, C> {
    async fn reset_transport(&self, failure: &Failure) {
        let endpoint = self.last.lock().unwrap().take();
        if let Some(endpoint) = endpoint {
            event!(Level::DEBUG, %endpoint, ?failure, "Resetting transport");
            self.balancer.pessimize(&endpoint).await;
        }
    }
}
