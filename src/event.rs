use color_eyre::{eyre::eyre, Result};
use futures::future::{join_all, BoxFuture, FutureExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::CacheStorage;
use crate::host::Notification;
use crate::network::Request;
use crate::worker::control::{ControlMessage, ReplyPort};
use crate::worker::fetch::FetchOutcome;
use crate::worker::lifecycle::ActivationReport;
use crate::worker::Controller;

/// Events the host delivers to the controller
#[derive(Debug)]
pub enum Event {
  /// A new generation is being installed
  Install,
  /// The installed generation takes over
  Activate {
    report_to: Option<oneshot::Sender<ActivationReport>>,
  },
  /// An outbound request to intercept
  Fetch {
    request: Request,
    respond_to: Option<oneshot::Sender<FetchOutcome>>,
  },
  /// Control message from the foreground application
  Message {
    message: ControlMessage,
    reply: Option<ReplyPort>,
  },
  /// Inbound push with its raw payload
  Push { payload: Option<Vec<u8>> },
  NotificationClick { notification: Notification },
  /// Deferred sync redelivered by the host
  Sync { tag: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
  Install,
  Activate,
  Fetch,
  Message,
  Push,
  NotificationClick,
  Sync,
}

impl EventKind {
  /// Lifecycle events run one at a time, in arrival order.
  pub fn is_lifecycle(self) -> bool {
    matches!(self, EventKind::Install | EventKind::Activate)
  }
}

impl Event {
  pub fn kind(&self) -> EventKind {
    match self {
      Event::Install => EventKind::Install,
      Event::Activate { .. } => EventKind::Activate,
      Event::Fetch { .. } => EventKind::Fetch,
      Event::Message { .. } => EventKind::Message,
      Event::Push { .. } => EventKind::Push,
      Event::NotificationClick { .. } => EventKind::NotificationClick,
      Event::Sync { .. } => EventKind::Sync,
    }
  }
}

/// Keeps an event alive until every async operation attached to it settles.
#[derive(Debug, Default)]
pub struct ExtendableEvent {
  pending: Mutex<Vec<JoinHandle<Result<()>>>>,
}

impl ExtendableEvent {
  pub fn new() -> Self {
    Self::default()
  }

  /// Start `work` now and hold the event open until it finishes.
  pub fn wait_until<F>(&self, work: F)
  where
    F: Future<Output = Result<()>> + Send + 'static,
  {
    let handle = tokio::spawn(work);
    match self.pending.lock() {
      Ok(mut pending) => pending.push(handle),
      Err(e) => warn!("Lifetime extension dropped: {}", e),
    }
  }

  /// Wait for every extension. Returns the first failure, after all have settled.
  pub async fn settle(&self) -> Result<()> {
    let mut first_error = None;

    loop {
      let batch = {
        let mut pending = self
          .pending
          .lock()
          .map_err(|e| eyre!("Lock poisoned: {}", e))?;
        std::mem::take(&mut *pending)
      };
      if batch.is_empty() {
        break;
      }

      for result in join_all(batch).await {
        let result = result
          .map_err(|e| eyre!("Extension task failed: {}", e))
          .and_then(|r| r);
        if let Err(e) = result {
          first_error.get_or_insert(e);
        }
      }
    }

    match first_error {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }
}

fn unexpected(handler: &str) -> color_eyre::Report {
  eyre!("{} handler received an event of another kind", handler)
}

type Handler = Box<dyn Fn(Event, Arc<ExtendableEvent>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Routes each event kind to the handler registered for it at startup.
#[derive(Default)]
pub struct Dispatcher {
  handlers: HashMap<EventKind, Handler>,
}

impl Dispatcher {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register (or replace) the handler for `kind`.
  pub fn on<F, Fut>(&mut self, kind: EventKind, handler: F)
  where
    F: Fn(Event, Arc<ExtendableEvent>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
  {
    self
      .handlers
      .insert(kind, Box::new(move |event, ext| handler(event, ext).boxed()));
  }

  /// Dispatcher with every controller handler registered.
  pub fn for_controller<S: CacheStorage + 'static>(controller: Arc<Controller<S>>) -> Self {
    let mut dispatcher = Self::new();

    dispatcher.register(&controller, EventKind::Install, |c, _, _| async move {
      c.lifecycle.install().await
    });

    dispatcher.register(&controller, EventKind::Activate, |c, event, _| async move {
      let Event::Activate { report_to } = event else {
        return Err(unexpected("Activate"));
      };
      let report = c.lifecycle.activate().await?;
      if let Some(tx) = report_to {
        let _ = tx.send(report);
      }
      Ok(())
    });

    dispatcher.register(&controller, EventKind::Fetch, |c, event, ext| async move {
      let Event::Fetch { request, respond_to } = event else {
        return Err(unexpected("Fetch"));
      };
      let outcome = c.fetch.handle(&request, &ext).await;
      if let Some(tx) = respond_to {
        // The requester may have gone away
        let _ = tx.send(outcome);
      }
      Ok(())
    });

    dispatcher.register(&controller, EventKind::Message, |c, event, _| async move {
      let Event::Message { message, reply } = event else {
        return Err(unexpected("Message"));
      };
      c.control.handle(&message, reply).await
    });

    dispatcher.register(&controller, EventKind::Push, |c, event, _| async move {
      let Event::Push { payload } = event else {
        return Err(unexpected("Push"));
      };
      c.push.on_push(payload.as_deref()).await.map(|_| ())
    });

    dispatcher.register(
      &controller,
      EventKind::NotificationClick,
      |c, event, _| async move {
        let Event::NotificationClick { notification } = event else {
          return Err(unexpected("Click"));
        };
        c.push.on_click(&notification).await.map(|_| ())
      },
    );

    dispatcher.register(&controller, EventKind::Sync, |c, event, _| async move {
      let Event::Sync { tag } = event else {
        return Err(unexpected("Sync"));
      };
      c.sync.on_sync(&tag).await.map(|_| ())
    });

    dispatcher
  }

  fn register<S, F, Fut>(&mut self, controller: &Arc<Controller<S>>, kind: EventKind, handler: F)
  where
    S: CacheStorage + 'static,
    F: Fn(Arc<Controller<S>>, Event, Arc<ExtendableEvent>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
  {
    let controller = Arc::clone(controller);
    self.on(kind, move |event, ext| {
      handler(Arc::clone(&controller), event, ext)
    });
  }

  /// Run the handler for `event` and every lifetime extension it registers.
  /// Events without a handler complete immediately.
  pub async fn dispatch(&self, event: Event) -> Result<()> {
    let kind = event.kind();
    let Some(handler) = self.handlers.get(&kind) else {
      debug!(?kind, "No handler registered");
      return Ok(());
    };

    let extendable = Arc::new(ExtendableEvent::new());
    let handled = handler(event, Arc::clone(&extendable)).await;
    let extended = extendable.settle().await;

    let result = handled.and(extended);
    if let Err(e) = &result {
      warn!(?kind, "Event failed: {}", e);
    }
    result
  }

  /// Start the event loop. Lifecycle events are processed in order, each
  /// finishing before the next starts; every other event runs as its own task.
  pub fn spawn(self: Arc<Self>) -> EventSender {
    let (tx, mut rx) = mpsc::unbounded_channel::<Queued>();

    tokio::spawn(async move {
      while let Some(Queued { event, settled }) = rx.recv().await {
        if event.kind().is_lifecycle() {
          let _ = settled.send(self.dispatch(event).await);
        } else {
          let dispatcher = Arc::clone(&self);
          tokio::spawn(async move {
            let _ = settled.send(dispatcher.dispatch(event).await);
          });
        }
      }
    });

    EventSender { tx }
  }
}

struct Queued {
  event: Event,
  settled: oneshot::Sender<Result<()>>,
}

/// Handle for delivering events to a running dispatcher.
#[derive(Clone)]
pub struct EventSender {
  tx: mpsc::UnboundedSender<Queued>,
}

impl EventSender {
  /// Queue an event; the receiver resolves once it has settled.
  pub fn post(&self, event: Event) -> Result<oneshot::Receiver<Result<()>>> {
    let (settled, rx) = oneshot::channel();
    self
      .tx
      .send(Queued { event, settled })
      .map_err(|_| eyre!("Event loop has stopped"))?;
    Ok(rx)
  }

  /// Queue an event and wait for it to settle.
  pub async fn send(&self, event: Event) -> Result<()> {
    self
      .post(event)?
      .await
      .map_err(|_| eyre!("Event dropped before it settled"))?
  }

  /// Activate and return what the purge of stale generations did.
  pub async fn activate(&self) -> Result<ActivationReport> {
    let (tx, rx) = oneshot::channel();
    self
      .send(Event::Activate {
        report_to: Some(tx),
      })
      .await?;
    rx.await
      .map_err(|_| eyre!("Activation settled without a report"))
  }

  /// Install, then activate only if the install succeeded.
  pub async fn upgrade(&self) -> Result<ActivationReport> {
    self.send(Event::Install).await?;
    self.activate().await
  }
}
