//! Cache lifecycle: seeding a generation on install and purging every other
//! generation on activation.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{run_blocking, CacheStorage, RequestKey};
use crate::host::Host;
use crate::network::{Network, Request, Response};

/// Lifecycle state of the current generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  /// Constructed, install not yet attempted
  Parsed,
  Installing,
  /// Manifest seeded, waiting to activate
  Installed,
  Activating,
  /// Controlling requests
  Activated,
  /// Install failed; this generation will never activate
  Redundant,
}

impl std::fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      LifecycleState::Parsed => write!(f, "parsed"),
      LifecycleState::Installing => write!(f, "installing"),
      LifecycleState::Installed => write!(f, "installed"),
      LifecycleState::Activating => write!(f, "activating"),
      LifecycleState::Activated => write!(f, "activated"),
      LifecycleState::Redundant => write!(f, "redundant"),
    }
  }
}

/// Outcome of purging stale generations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
  pub deleted: Vec<String>,
  /// Generations whose deletion failed, with the error message
  pub failed: Vec<(String, String)>,
}

/// Owns the current generation and its transitions.
pub struct LifecycleManager<S: CacheStorage> {
  generation: String,
  manifest: Vec<Url>,
  storage: Arc<S>,
  network: Arc<dyn Network>,
  host: Arc<dyn Host>,
  state: RwLock<LifecycleState>,
}

impl<S: CacheStorage + 'static> LifecycleManager<S> {
  pub fn new(
    generation: String,
    manifest: Vec<Url>,
    storage: Arc<S>,
    network: Arc<dyn Network>,
    host: Arc<dyn Host>,
  ) -> Self {
    Self {
      generation,
      manifest,
      storage,
      network,
      host,
      state: RwLock::new(LifecycleState::Parsed),
    }
  }

  pub fn generation(&self) -> &str {
    &self.generation
  }

  pub fn state(&self) -> LifecycleState {
    self
      .state
      .read()
      .map(|s| *s)
      .unwrap_or(LifecycleState::Redundant)
  }

  fn set_state(&self, new_state: LifecycleState) {
    if let Ok(mut state) = self.state.write() {
      let old_state = *state;
      if old_state != new_state {
        debug!(generation = %self.generation, from = %old_state, to = %new_state, "Lifecycle transition");
        *state = new_state;
      }
    }
  }

  /// Seed the current generation with every manifest resource, then ask the
  /// host to activate it immediately.
  ///
  /// Nothing is written unless every resource was fetched with a 2xx status.
  pub async fn install(&self) -> Result<()> {
    self.set_state(LifecycleState::Installing);
    info!(generation = %self.generation, resources = self.manifest.len(), "Installing");

    match self.seed().await {
      Ok(()) => {
        self.set_state(LifecycleState::Installed);
        self.host.skip_waiting().await?;
        info!(generation = %self.generation, "Installed");
        Ok(())
      }
      Err(e) => {
        self.set_state(LifecycleState::Redundant);
        error!(generation = %self.generation, "Install failed: {}", e);
        Err(e)
      }
    }
  }

  async fn seed(&self) -> Result<()> {
    let fetches = self.manifest.iter().map(|url| {
      let network = Arc::clone(&self.network);
      let request = Request::get(url.clone());
      async move {
        let response = network.fetch(&request).await?;
        if !response.is_success() {
          return Err(eyre!(
            "Manifest resource {} returned status {}",
            request.url,
            response.status
          ));
        }
        Ok::<(RequestKey, Response), color_eyre::Report>((request.key(), response))
      }
    });

    let entries = try_join_all(fetches).await?;

    let generation = self.generation.clone();
    run_blocking(&self.storage, move |s| s.seed(&generation, &entries)).await
  }

  /// Delete every generation except the current one and claim all open
  /// contexts. Deletions are independent; a failed one is logged and reported
  /// without stopping the rest.
  pub async fn activate(&self) -> Result<ActivationReport> {
    self.ensure_installed().await?;
    self.set_state(LifecycleState::Activating);
    info!(generation = %self.generation, "Activating");

    let (report, claimed) = tokio::join!(self.purge_stale(), self.host.claim_clients());
    let report = report?;
    claimed?;

    self.set_state(LifecycleState::Activated);
    info!(
      generation = %self.generation,
      deleted = report.deleted.len(),
      failed = report.failed.len(),
      "Activated"
    );
    Ok(report)
  }

  /// Activation must follow a completed install. A fresh process finds the
  /// seeded generation in storage instead of in memory; a generation that
  /// only holds fetched responses does not count.
  async fn ensure_installed(&self) -> Result<()> {
    match self.state() {
      LifecycleState::Installed | LifecycleState::Activated => Ok(()),
      LifecycleState::Parsed => {
        let generation = self.generation.clone();
        let installed = run_blocking(&self.storage, move |s| s.is_seeded(&generation)).await?;
        if installed {
          Ok(())
        } else {
          Err(eyre!(
            "Cannot activate {}: generation is not installed",
            self.generation
          ))
        }
      }
      state => Err(eyre!(
        "Cannot activate {} while {}",
        self.generation,
        state
      )),
    }
  }

  async fn purge_stale(&self) -> Result<ActivationReport> {
    let names = run_blocking(&self.storage, |s| s.cache_names()).await?;

    let deletions = names
      .into_iter()
      .filter(|name| *name != self.generation)
      .map(|name| {
        let storage = Arc::clone(&self.storage);
        async move {
          let target = name.clone();
          let result = run_blocking(&storage, move |s| s.delete_cache(&target)).await;
          (name, result)
        }
      });

    let mut report = ActivationReport::default();
    for (name, result) in futures::future::join_all(deletions).await {
      match result {
        Ok(_) => {
          info!(generation = %name, "Deleted stale cache");
          report.deleted.push(name);
        }
        Err(e) => {
          warn!(generation = %name, "Failed to delete stale cache: {}", e);
          report.failed.push((name, e.to_string()));
        }
      }
    }

    Ok(report)
  }

  /// Force the installed generation to take over without waiting.
  pub async fn skip_waiting(&self) -> Result<()> {
    info!(generation = %self.generation, "Skip waiting requested");
    self.host.skip_waiting().await
  }
}
