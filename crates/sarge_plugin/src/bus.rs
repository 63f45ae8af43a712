//! # Event bus connecting the lifecycle state machine to plugins.
//!
//! Handlers run synchronously, in subscription order, on the publishing
//! thread. The first handler error stops the pipeline and is returned to the
//! publisher wrapped in [`PluginError::Handler`], naming the plugin and signal.
//!
//! Payloads borrow the caller's state mutably where plugins are expected to
//! contribute (`ActivateVersion`, `WillStart`, `Configuring`), so independent
//! plugins compose by appending programs or setting AppConfig keys in place.
use std::sync::Arc;

use tracing::{debug, trace};

use crate::{
    message::{ActivationContext, Program, Target},
    plugin::PluginError,
};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
pub enum Signal {
    /// Plugins are loaded; nothing has been touched yet.
    PreInit,
    /// An instance's program list is being assembled.
    Configuring,
    /// An instance is about to start; last chance to mutate its AppConfig.
    WillStart,
    HasStopped,
    WillDestroy,
    /// A deployment version is being activated (before the commit point).
    ActivateVersion,
    /// A deployment version is live and its programs were restarted.
    VersionActivated,
}

pub enum Event<'a> {
    PreInit,
    Configuring {
        target: &'a Target,
        programs: &'a mut Vec<Program>,
    },
    WillStart {
        target: &'a Target,
        context: &'a mut ActivationContext,
    },
    HasStopped {
        target: &'a Target,
    },
    WillDestroy {
        target: &'a Target,
    },
    ActivateVersion {
        target: &'a Target,
        context: &'a mut ActivationContext,
    },
    VersionActivated {
        target: &'a Target,
        context: &'a ActivationContext,
    },
}

impl Event<'_> {
    pub fn signal(&self) -> Signal {
        match self {
            Event::PreInit => Signal::PreInit,
            Event::Configuring { .. } => Signal::Configuring,
            Event::WillStart { .. } => Signal::WillStart,
            Event::HasStopped { .. } => Signal::HasStopped,
            Event::WillDestroy { .. } => Signal::WillDestroy,
            Event::ActivateVersion { .. } => Signal::ActivateVersion,
            Event::VersionActivated { .. } => Signal::VersionActivated,
        }
    }

    pub fn target(&self) -> Option<&Target> {
        match self {
            Event::PreInit => None,
            Event::Configuring { target, .. }
            | Event::WillStart { target, .. }
            | Event::HasStopped { target }
            | Event::WillDestroy { target }
            | Event::ActivateVersion { target, .. }
            | Event::VersionActivated { target, .. } => Some(*target),
        }
    }

    pub fn app_name(&self) -> Option<&str> {
        self.target().map(|t| t.app_name.as_str())
    }
}

/// Restricts a subscription to one application, or none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppFilter {
    Any,
    Named(String),
}

impl AppFilter {
    pub fn matches(&self, app_name: Option<&str>) -> bool {
        match self {
            AppFilter::Any => true,
            AppFilter::Named(wanted) => app_name == Some(wanted.as_str()),
        }
    }
}

/// Something that reacts to bus events.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &mut Event<'_>) -> Result<(), PluginError>;
}

impl<F> EventHandler for F
where
    F: Fn(&mut Event<'_>) -> Result<(), PluginError> + Send + Sync,
{
    fn handle(&self, event: &mut Event<'_>) -> Result<(), PluginError> {
        self(event)
    }
}

struct Subscription {
    owner: String,
    signal: Signal,
    filter: AppFilter,
    handler: Arc<dyn EventHandler>,
}

/// Ordered publish/subscribe channel owned by the orchestrator.
///
/// Subscriptions hold strong references and live as long as the bus.
#[derive(Default)]
pub struct EventBus {
    subscriptions: Vec<Subscription>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
        owner: &str,
        signal: Signal,
        filter: AppFilter,
        handler: Arc<dyn EventHandler>,
    ) {
        trace!(plugin = owner, %signal, "subscribed");
        self.subscriptions.push(Subscription {
            owner: owner.to_string(),
            signal,
            filter,
            handler,
        });
    }

    /// Deliver `event` to every matching subscriber in subscription order.
    pub fn publish(&self, event: &mut Event<'_>) -> Result<(), PluginError> {
        let signal = event.signal();
        let app_name = event.app_name().map(str::to_owned);
        for sub in self
            .subscriptions
            .iter()
            .filter(|s| s.signal == signal && s.filter.matches(app_name.as_deref()))
        {
            debug!(plugin = %sub.owner, %signal, app = ?app_name, "dispatching");
            sub.handler
                .handle(event)
                .map_err(|source| PluginError::Handler {
                    plugin: sub.owner.clone(),
                    signal,
                    source: Box::new(source),
                })?;
        }
        Ok(())
    }
}

/// Handed to a plugin factory so its subscriptions are attributed to it.
pub struct PluginRegistrar<'a> {
    owner: String,
    bus: &'a mut EventBus,
}

impl<'a> PluginRegistrar<'a> {
    pub fn new<O: Into<String>>(owner: O, bus: &'a mut EventBus) -> Self {
        Self {
            owner: owner.into(),
            bus,
        }
    }

    /// Subscribe `handler` to `signal` for every application.
    pub fn on(&mut self, signal: Signal, handler: Arc<dyn EventHandler>) {
        self.bus.subscribe(&self.owner, signal, AppFilter::Any, handler);
    }

    /// Subscribe `handler` to `signal` for one application only.
    pub fn on_app(&mut self, signal: Signal, app_name: &str, handler: Arc<dyn EventHandler>) {
        self.bus.subscribe(
            &self.owner,
            signal,
            AppFilter::Named(app_name.to_string()),
            handler,
        );
    }

    pub fn on_fn<F>(&mut self, signal: Signal, handler: F)
    where
        F: Fn(&mut Event<'_>) -> Result<(), PluginError> + Send + Sync + 'static,
    {
        self.on(signal, Arc::new(handler));
    }
}
