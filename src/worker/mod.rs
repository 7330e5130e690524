//! The offline resilience controller and its components.

pub mod control;
pub mod fetch;
pub mod lifecycle;
pub mod push;
pub mod sync;

use color_eyre::Result;
use std::sync::Arc;

use crate::cache::{CacheStorage, RequestKey};
use crate::config::Config;
use crate::host::Host;
use crate::network::Network;

use control::ControlHandler;
use fetch::FetchInterceptor;
use lifecycle::LifecycleManager;
use push::PushDispatcher;
use sync::{SyncCoordinator, SyncTask};

/// One generation's controller: every component wired to the same storage,
/// network and host.
pub struct Controller<S: CacheStorage> {
  pub lifecycle: Arc<LifecycleManager<S>>,
  pub fetch: FetchInterceptor<S>,
  pub control: ControlHandler<S>,
  pub push: PushDispatcher,
  pub sync: SyncCoordinator,
}

impl<S: CacheStorage + 'static> Controller<S> {
  pub fn new(
    config: &Config,
    storage: Arc<S>,
    network: Arc<dyn Network>,
    host: Arc<dyn Host>,
    sync_task: Arc<dyn SyncTask>,
  ) -> Result<Self> {
    config.validate()?;
    let generation = config.generation.cache_name();

    let lifecycle = Arc::new(LifecycleManager::new(
      generation.clone(),
      config.manifest_urls()?,
      Arc::clone(&storage),
      Arc::clone(&network),
      Arc::clone(&host),
    ));

    let fetch = FetchInterceptor::new(
      generation,
      RequestKey::get(&config.offline_url()?),
      Arc::clone(&storage),
      network,
    );

    let control = ControlHandler::new(storage, Arc::clone(&lifecycle));
    let push = PushDispatcher::new(config.notifications.clone(), config.origin_url()?, host);
    let sync = SyncCoordinator::new(config.sync_tag.clone(), sync_task);

    Ok(Self {
      lifecycle,
      fetch,
      control,
      push,
      sync,
    })
  }
}
