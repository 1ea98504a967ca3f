//! [`ShapeSubscriber`] over HTTP.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use tracing::debug;

use super::apply::load_position;
use super::client::ShapeClient;
use super::stream::{HttpShapeStream, RetryPolicy, ShapeSync, StreamShared};
use crate::config::{Settings, SettingsError};
use crate::shape::{ShapeStream, ShapeSubscriber, SubscriptionConfig, TransportError};

/// Streams shapes from the remote endpoint into the replica.
///
/// Only one stream per shape key may be active at a time.
#[derive(Clone)]
pub struct HttpShapeSubscriber {
    client: ShapeClient,
    retry: RetryPolicy,
    active: Arc<DashSet<String>>,
}

impl HttpShapeSubscriber {
    pub fn new(client: ShapeClient, retry: RetryPolicy) -> Self {
        Self {
            client,
            retry,
            active: Arc::new(DashSet::new()),
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, SettingsError> {
        let remote = &settings.remote;
        let client = ShapeClient::new(remote.base_url()?, remote.request_timeout())
            .map_err(|e| SettingsError::InvalidConfig(e.to_string()))?;
        Ok(Self::new(
            client,
            RetryPolicy {
                initial: remote.retry_initial(),
                max: remote.retry_max(),
            },
        ))
    }

    /// Shape keys with a running stream.
    pub fn active_shapes(&self) -> Vec<String> {
        self.active.iter().map(|k| k.key().clone()).collect()
    }
}

#[async_trait]
impl ShapeSubscriber for HttpShapeSubscriber {
    async fn subscribe(
        &self,
        config: SubscriptionConfig,
    ) -> Result<Arc<dyn ShapeStream>, TransportError> {
        let shape_key = config.shape_key.to_string();
        if !self.active.insert(shape_key.clone()) {
            return Err(TransportError::AlreadySubscribing(shape_key));
        }

        let shared = StreamShared::new(shape_key.clone(), self.active.clone());
        let result = async {
            let position = config
                .db
                .with_conn(|conn| load_position(conn, &shape_key))?;
            debug!(shape_key = %shape_key, position = ?position, "subscribing to shape");

            let mut sync = ShapeSync::new(
                self.client.clone(),
                config,
                position,
                shared.clone(),
                self.retry,
            );
            // The first request runs here so establishment errors reach the caller.
            sync.step().await?;
            Ok::<_, TransportError>(sync)
        }
        .await;

        match result {
            Ok(sync) => Ok(Arc::new(HttpShapeStream::spawn(sync))),
            Err(e) => {
                self.active.remove(&shape_key);
                Err(e)
            }
        }
    }
}
