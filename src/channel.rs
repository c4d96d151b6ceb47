//! One transport channel per endpoint, created lazily and shared.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::time::Duration;
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to create channel to {endpoint}")]
    Create {
        endpoint: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Channel pool has been disposed")]
    Disposed,
}

/// Describes how to open and gracefully close a channel.
#[async_trait]
pub trait ChannelFactory: Send + Sync + 'static {
    type Channel: Send + Sync + 'static;

    /// Opens a channel to the given endpoint string.
    async fn create(&self, endpoint: &str) -> Result<Self::Channel, anyhow::Error>;

    /// Gracefully shuts a channel down before it is dropped.
    ///
    /// By default, does nothing.
    async fn shutdown(&self, _channel: &Self::Channel) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

pub type SharedChannelFactory<C> = Arc<dyn ChannelFactory<Channel = C>>;

// Each entry is created before the channel itself, so racing first-time
// callers share the same cell and a single factory call.
//
// An entry may be removed from the map while its channel is still being
// created. Whoever first sets "retired" on an entry with a channel shuts
// that channel down, whether that is the remover or the creator.
struct Entry<C> {
    channel: OnceCell<Arc<C>>,
    retired: AtomicBool,
}

impl<C> Entry<C> {
    fn new() -> Self {
        Self {
            channel: OnceCell::new(),
            retired: AtomicBool::new(false),
        }
    }

    // Returns the channel if the caller is now responsible for shutting it
    // down.
    fn retire(&self) -> Option<&Arc<C>> {
        let channel = self.channel.get()?;
        (!self.retired.swap(true, Ordering::AcqRel)).then_some(channel)
    }
}

type ChannelCell<C> = Arc<Entry<C>>;

/// Caches channels by endpoint string.
pub struct ChannelPool<C: Send + Sync + 'static> {
    factory: SharedChannelFactory<C>,
    shutdown_timeout: Duration,

    // "None" once the pool has been disposed.
    channels: Mutex<Option<HashMap<String, ChannelCell<C>>>>,
}

impl<C: Send + Sync + 'static> ChannelPool<C> {
    pub fn new(factory: SharedChannelFactory<C>, shutdown_timeout: Duration) -> Self {
        Self {
            factory,
            shutdown_timeout,
            channels: Mutex::new(Some(HashMap::new())),
        }
    }

    /// Returns the channel for an endpoint, creating it on first use.
    ///
    /// At most one channel is ever created per endpoint string, even when
    /// many callers race to use an endpoint for the first time. If creation
    /// fails, the next caller tries again.
    ///
    /// A channel whose endpoint is removed while it is being created is shut
    /// down instead of returned. After [Self::dispose_all], the caller gets
    /// [Error::Disposed]; after [Self::remove_channels], a new channel is
    /// created.
    pub async fn get_channel(&self, endpoint: &str) -> Result<Arc<C>, Error> {
        loop {
            let cell = {
                let mut channels = self.channels.lock().unwrap();
                let channels = channels.as_mut().ok_or(Error::Disposed)?;
                channels
                    .entry(endpoint.to_string())
                    .or_insert_with(|| Arc::new(Entry::new()))
                    .clone()
            };

            let channel = cell
                .channel
                .get_or_try_init(|| async {
                    event!(Level::DEBUG, endpoint, "Creating channel");
                    self.factory
                        .create(endpoint)
                        .await
                        .map(Arc::new)
                        .map_err(|source| {
                            event!(Level::WARN, endpoint, err = ?source, "Failed to create channel");
                            Error::Create {
                                endpoint: endpoint.to_string(),
                                source,
                            }
                        })
                })
                .await?
                .clone();

            let current = match self.channels.lock().unwrap().as_ref() {
                None => None,
                Some(channels) => Some(
                    channels
                        .get(endpoint)
                        .is_some_and(|entry| Arc::ptr_eq(entry, &cell)),
                ),
            };
            match current {
                Some(true) => return Ok(channel),
                Some(false) => {
                    event!(Level::DEBUG, endpoint, "Endpoint removed during channel creation");
                    self.shutdown_all(vec![(endpoint.to_string(), cell)]).await;
                }
                None => {
                    self.shutdown_all(vec![(endpoint.to_string(), cell)]).await;
                    return Err(Error::Disposed);
                }
            }
        }
    }

    /// Shuts down and forgets the channels of the given endpoints.
    #[instrument(skip_all, name = "ChannelPool::remove_channels")]
    pub async fn remove_channels<I, S>(&self, endpoints: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let removed: Vec<_> = {
            let mut channels = self.channels.lock().unwrap();
            let Some(channels) = channels.as_mut() else {
                return;
            };
            endpoints
                .into_iter()
                .filter_map(|endpoint| {
                    let endpoint = endpoint.as_ref();
                    channels
                        .remove(endpoint)
                        .map(|cell| (endpoint.to_string(), cell))
                })
                .collect()
        };
        self.shutdown_all(removed).await;
    }

    /// Shuts down every channel. Later calls to [Self::get_channel] fail.
    #[instrument(skip_all, name = "ChannelPool::dispose_all")]
    pub async fn dispose_all(&self) {
        let Some(channels) = self.channels.lock().unwrap().take() else {
            return;
        };
        self.shutdown_all(channels.into_iter().collect()).await;
    }

    /// The number of channels which have been created and not removed.
    pub fn len(&self) -> usize {
        self.channels
            .lock()
            .unwrap()
            .as_ref()
            .map(|channels| {
                channels
                    .values()
                    .filter(|entry| entry.channel.initialized())
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn shutdown_all(&self, cells: Vec<(String, ChannelCell<C>)>) {
        join_all(cells.into_iter().map(|(endpoint, cell)| async move {
            // Creation may have failed or not finished, or someone else is
            // already shutting the channel down.
            let Some(channel) = cell.retire() else {
                return;
            };
            match tokio::time::timeout(self.shutdown_timeout, self.factory.shutdown(channel))
                .await
            {
                Ok(Ok(())) => event!(Level::DEBUG, %endpoint, "Channel shut down"),
                Ok(Err(err)) => {
                    event!(Level::WARN, %endpoint, ?err, "Channel shutdown failed")
                }
                Err(_) => event!(Level::WARN, %endpoint, "Channel shutdown timed out"),
            }
        }))
        .await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::CountingChannelFactory;

    fn pool(factory: &Arc<CountingChannelFactory>) -> ChannelPool<String> {
        ChannelPool::new(factory.clone(), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn concurrent_first_use_creates_one_channel() {
        let factory = Arc::new(CountingChannelFactory::new(Duration::from_millis(10)));
        let pool = Arc::new(pool(&factory));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.get_channel("grpc://a:2135").await.unwrap() })
            })
            .collect();

        let channels: Vec<Arc<String>> = join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(factory.created(), 1);
        assert!(channels.iter().all(|c| Arc::ptr_eq(c, &channels[0])));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn failed_creation_is_retried() {
        let factory = Arc::new(CountingChannelFactory::new(Duration::ZERO));
        let pool = pool(&factory);

        factory.fail_next(true);
        assert!(matches!(
            pool.get_channel("grpc://a:2135").await,
            Err(Error::Create { .. })
        ));
        assert!(pool.is_empty());

        factory.fail_next(false);
        pool.get_channel("grpc://a:2135").await.unwrap();
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn remove_channels_shuts_them_down() {
        let factory = Arc::new(CountingChannelFactory::new(Duration::ZERO));
        let pool = pool(&factory);

        let first = pool.get_channel("grpc://a:2135").await.unwrap();
        pool.get_channel("grpc://b:2135").await.unwrap();

        pool.remove_channels(["grpc://a:2135", "grpc://unknown:1"]).await;
        assert_eq!(factory.shut_down(), 1);
        assert_eq!(pool.len(), 1);

        // The endpoint comes back with a fresh channel.
        let second = pool.get_channel("grpc://a:2135").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(factory.created(), 3);
    }

    #[tokio::test]
    async fn dispose_all_is_final() {
        let factory = Arc::new(CountingChannelFactory::new(Duration::ZERO));
        let pool = pool(&factory);

        pool.get_channel("grpc://a:2135").await.unwrap();
        pool.get_channel("grpc://b:2135").await.unwrap();
        pool.dispose_all().await;
        assert_eq!(factory.shut_down(), 2);

        assert!(matches!(
            pool.get_channel("grpc://a:2135").await,
            Err(Error::Disposed)
        ));
        pool.dispose_all().await;
        assert_eq!(factory.shut_down(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_shutdown_is_abandoned() {
        let factory = Arc::new(CountingChannelFactory::new(Duration::ZERO));
        factory.stall_shutdown();
        let pool = pool(&factory);

        pool.get_channel("grpc://a:2135").await.unwrap();
        let start = tokio::time::Instant::now();
        pool.dispose_all().await;
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn channel_created_during_dispose_is_shut_down() {
        let factory = Arc::new(CountingChannelFactory::new(Duration::from_millis(50)));
        let pool = Arc::new(pool(&factory));

        let creating = tokio::spawn({
            let pool = pool.clone();
            async move { pool.get_channel("grpc://a:2135").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.dispose_all().await;
        assert_eq!(factory.shut_down(), 0);

        assert!(matches!(creating.await.unwrap(), Err(Error::Disposed)));
        assert_eq!(factory.created(), 1);
        assert_eq!(factory.shut_down(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_created_during_removal_is_replaced() {
        let factory = Arc::new(CountingChannelFactory::new(Duration::from_millis(50)));
        let pool = Arc::new(pool(&factory));

        let creating = tokio::spawn({
            let pool = pool.clone();
            async move { pool.get_channel("grpc://a:2135").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.remove_channels(["grpc://a:2135"]).await;

        creating.await.unwrap().unwrap();
        assert_eq!(factory.created(), 2);
        assert_eq!(factory.shut_down(), 1);
        assert_eq!(pool.len(), 1);

        pool.dispose_all().await;
        assert_eq!(factory.shut_down(), 2);
    }
}
