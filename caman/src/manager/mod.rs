//! The CA manager: plug-in registry, service binding and message bus.
//!
//! A [`CaManager`] is an explicit value; receivers with several tuners run
//! one per transport stream. Plug-ins are called without any manager lock
//! held, so a plug-in may send messages (or a driver thread may fire
//! callbacks) while the manager is calling into it.

mod bus;
mod service;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, ReentrantMutex};

use caman_protocol::{AppMessage, CaError, CaMessage, Destination, Message};

use crate::plugin::{CaOptions, CaPlugin, CaResult, CaType, TsContext, TsParams};
use crate::ts_analyzer::TableMonitor;

pub use bus::{MsgCallback, MsgSender, MAX_QUEUED_MESSAGES};

/// Lifecycle state of a registered plug-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginState {
    Registered,
    Opened,
    Enabled,
}

impl PluginState {
    pub fn is_open(self) -> bool {
        self != PluginState::Registered
    }
}

/// Diagnostic view of a registered plug-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: String,
    pub ca_type: CaType,
    pub auto_match: bool,
    pub state: PluginState,
}

/// A started service and the plug-in descrambling it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceBinding {
    pub service_id: u16,
    /// `None` when the service carries no CA system and needs no plug-in.
    pub ca_name: Option<String>,
    /// Last PMT section delivered for the service.
    pub pmt: Vec<u8>,
    /// A PMT has already been delivered to the bound plug-in, so the next
    /// delivery is an update.
    pub seen: bool,
    /// Bound by explicit name rather than by CA system match.
    pub forced: bool,
}

struct PluginEntry {
    name: String,
    plugin: Arc<dyn CaPlugin>,
    options: CaOptions,
    ca_type: CaType,
    state: PluginState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Deferred {
    Start {
        service_id: u16,
        forced: Option<String>,
    },
    Stop {
        service_id: u16,
    },
}

impl Deferred {
    fn service_id(&self) -> u16 {
        match self {
            Deferred::Start { service_id, .. } | Deferred::Stop { service_id } => *service_id,
        }
    }
}

#[derive(Default)]
struct State {
    ts: Option<TsContext>,
    generation: u64,
    paused: bool,
    /// Registration order.
    plugins: Vec<PluginEntry>,
    bindings: HashMap<u16, ServiceBinding>,
    deferred: Vec<Deferred>,
}

impl State {
    fn find(&self, name: &str) -> CaResult<&PluginEntry> {
        self.plugins
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| CaError::NotFound(name.to_string()))
    }

    fn find_mut(&mut self, name: &str) -> CaResult<&mut PluginEntry> {
        self.plugins
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| CaError::NotFound(name.to_string()))
    }

    fn set_state(&mut self, name: &str, state: PluginState) {
        if let Ok(entry) = self.find_mut(name) {
            entry.state = state;
        }
    }

    /// Remove every binding served by `name`, returning their service ids.
    fn drop_bindings_of(&mut self, name: &str) -> Vec<u16> {
        let mut sids: Vec<u16> = self
            .bindings
            .values()
            .filter(|b| b.ca_name.as_deref() == Some(name))
            .map(|b| b.service_id)
            .collect();
        sids.sort_unstable();
        for sid in &sids {
            self.bindings.remove(sid);
        }
        sids
    }

    fn open_plugins(&self) -> Vec<Arc<dyn CaPlugin>> {
        self.plugins
            .iter()
            .filter(|p| p.state.is_open())
            .map(|p| Arc::clone(&p.plugin))
            .collect()
    }
}

pub(crate) struct Shared {
    state: Mutex<State>,
    tables: Mutex<TableMonitor>,
    tables_changed: Condvar,
    bus: bus::MessageBus,
    /// Serializes lifecycle and binding operations so PMT deliveries for a
    /// service reach its plug-in in call order. Re-entrant so a message
    /// callback may call back into the manager.
    ops: ReentrantMutex<()>,
}

impl Shared {
    /// Route a message sent by a plug-in. A refused message is handed back
    /// to the plug-in's `free_msg`.
    fn route(&self, mut msg: Message) -> CaResult {
        let refused = {
            let mut state = self.state.lock();
            let entry = state.find(&msg.ca_name)?;
            let plugin = Arc::clone(&entry.plugin);
            if entry.state != PluginState::Enabled {
                Some((plugin, CaError::Disabled(msg.ca_name.clone())))
            } else {
                match msg.dest {
                    Destination::Ca => Some((
                        plugin,
                        CaError::BadParam("plug-ins cannot address another plug-in".into()),
                    )),
                    Destination::Manager => {
                        if let CaMessage::CamState { inserted: false } = msg.body {
                            let dropped = state.drop_bindings_of(&msg.ca_name);
                            warn!(
                                "CAM removed from {}, services {:?} unbound",
                                msg.ca_name, dropped
                            );
                        }
                        msg.dest = Destination::App;
                        None
                    }
                    Destination::App => None,
                }
            }
        };
        if let Some((plugin, e)) = refused {
            plugin.free_msg(msg);
            return Err(e);
        }

        let (result, dropped) = self.bus.deliver(msg);
        for msg in dropped {
            self.free(msg);
        }
        result
    }

    fn free(&self, msg: Message) {
        let plugin = self
            .state
            .lock()
            .find(&msg.ca_name)
            .ok()
            .map(|p| Arc::clone(&p.plugin));
        match plugin {
            Some(plugin) => plugin.free_msg(msg),
            None => drop(msg),
        }
    }
}

/// The conditional access manager.
pub struct CaManager {
    shared: Arc<Shared>,
}

impl Default for CaManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CaManager {
    /// Create a closed manager with no plug-ins.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                tables: Mutex::new(TableMonitor::new()),
                tables_changed: Condvar::new(),
                bus: bus::MessageBus::default(),
                ops: ReentrantMutex::new(()),
            }),
        }
    }

    /// Attach to a transport stream.
    pub fn open(&self, params: TsParams) -> CaResult {
        let _ops = self.shared.ops.lock();
        let mut state = self.shared.state.lock();
        if state.ts.is_some() {
            return Err(CaError::AlreadyOpen);
        }

        state.generation += 1;
        state.ts = Some(TsContext {
            params,
            generation: state.generation,
        });
        state.paused = false;
        drop(state);

        self.shared.tables.lock().reset();
        info!(
            "CA manager opened (frontend {}, demux {})",
            params.frontend, params.demux
        );
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.shared.state.lock().ts.is_some()
    }

    /// Stop every service, close and disable every open plug-in and detach
    /// from the stream. Closing a closed manager succeeds.
    pub fn close(&self) -> CaResult {
        let _ops = self.shared.ops.lock();
        let open: Vec<String> = {
            let state = self.shared.state.lock();
            if state.ts.is_none() {
                return Ok(());
            }
            state
                .plugins
                .iter()
                .filter(|p| p.state.is_open())
                .map(|p| p.name.clone())
                .collect()
        };

        for name in open {
            if let Err(e) = self.stop_ca(&name) {
                warn!("Failed to stop {} while closing: {}", name, e);
            }
        }

        let mut state = self.shared.state.lock();
        state.bindings.clear();
        state.deferred.clear();
        state.paused = false;
        state.ts = None;
        drop(state);

        self.shared.tables.lock().reset();
        info!("CA manager closed");
        Ok(())
    }

    /// Suspend table monitoring and binding. Service requests made while
    /// paused are replayed by [`resume`](Self::resume).
    pub fn pause(&self) -> CaResult {
        let _ops = self.shared.ops.lock();
        let mut state = self.shared.state.lock();
        if state.ts.is_none() {
            return Err(CaError::NotOpen);
        }
        if !state.paused {
            info!("CA manager paused");
            state.paused = true;
        }
        Ok(())
    }

    /// Resume after [`pause`](Self::pause) and replay the requests recorded
    /// meanwhile. Every request is replayed; the first failure is returned.
    pub fn resume(&self) -> CaResult {
        let ops = self.shared.ops.lock();
        let deferred = {
            let mut state = self.shared.state.lock();
            if state.ts.is_none() {
                return Err(CaError::NotOpen);
            }
            if !state.paused {
                return Ok(());
            }
            state.paused = false;
            std::mem::take(&mut state.deferred)
        };
        drop(ops);
        info!("CA manager resumed, replaying {} requests", deferred.len());

        let mut result = Ok(());
        for request in deferred {
            let outcome = match &request {
                Deferred::Start { service_id, forced } => {
                    self.start_service(*service_id, forced.as_deref())
                }
                Deferred::Stop { service_id } => self.stop_service(*service_id),
            };
            if let Err(e) = outcome {
                warn!("Replayed request {:?} failed: {}", request, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().paused
    }

    /// Register a plug-in under a unique name.
    pub fn register_ca(
        &self,
        name: &str,
        plugin: Arc<dyn CaPlugin>,
        options: CaOptions,
    ) -> CaResult {
        if name.is_empty() {
            return Err(CaError::BadParam("empty CA name".into()));
        }

        let _ops = self.shared.ops.lock();
        let mut state = self.shared.state.lock();
        if state.plugins.iter().any(|p| p.name == name) {
            return Err(CaError::AlreadyExists(name.to_string()));
        }

        let ca_type = plugin.ca_type();
        state.plugins.try_reserve(1)?;
        state.plugins.push(PluginEntry {
            name: name.to_string(),
            plugin,
            options,
            ca_type,
            state: PluginState::Registered,
        });
        info!(
            "Registered CA {} ({}, auto_match={})",
            name, ca_type, options.auto_match
        );
        Ok(())
    }

    /// Remove a plug-in. An open plug-in is stopped first as by
    /// [`stop_ca`](Self::stop_ca). Messages it left in the queue are freed.
    pub fn unregister_ca(&self, name: &str) -> CaResult {
        let _ops = self.shared.ops.lock();
        let (plugin, was_open) = {
            let state = self.shared.state.lock();
            let entry = state.find(name)?;
            (Arc::clone(&entry.plugin), entry.state.is_open())
        };

        if was_open {
            if let Err(e) = self.stop_ca(name) {
                warn!("Stopping {} before unregistering failed: {}", name, e);
            }
        }

        for msg in self.shared.bus.drain_from(name) {
            plugin.free_msg(msg);
        }
        self.shared.bus.set_callback(Some(name), None);
        let mut state = self.shared.state.lock();
        state.drop_bindings_of(name);
        state.plugins.retain(|p| p.name != name);
        drop(state);
        info!("Unregistered CA {}", name);
        Ok(())
    }

    /// Open a plug-in on the current stream and enable it.
    pub fn open_ca(&self, name: &str) -> CaResult {
        let _ops = self.shared.ops.lock();
        let (plugin, ts) = {
            let state = self.shared.state.lock();
            let ts = state.ts.clone().ok_or(CaError::NotOpen)?;
            let entry = state.find(name)?;
            if entry.state.is_open() {
                return Err(CaError::AlreadyOpen);
            }
            (Arc::clone(&entry.plugin), ts)
        };

        plugin.open(&ts)?;
        match plugin.register_msg_send(name, MsgSender::new(name, &self.shared)) {
            Ok(()) | Err(CaError::NotSupported) => {}
            Err(e) => {
                warn!("{} refused the message sender: {}", name, e);
                let _ = plugin.close();
                return Err(e);
            }
        }

        self.shared.state.lock().set_state(name, PluginState::Enabled);
        if let Err(e) = plugin.enable(true) {
            warn!("Enabling {} failed: {}", name, e);
            self.shared.state.lock().set_state(name, PluginState::Registered);
            let _ = plugin.close();
            return Err(e);
        }

        info!("Opened CA {}", name);
        Ok(())
    }

    /// Close a plug-in. Services it served are unbound without a stop
    /// command; use [`stop_ca`](Self::stop_ca) to stop them first.
    pub fn close_ca(&self, name: &str) -> CaResult {
        let _ops = self.shared.ops.lock();
        let plugin = {
            let mut state = self.shared.state.lock();
            let entry = state.find(name)?;
            if !entry.state.is_open() {
                return Err(CaError::NotOpen);
            }
            let plugin = Arc::clone(&entry.plugin);
            let dropped = state.drop_bindings_of(name);
            if !dropped.is_empty() {
                debug!("Closing {} unbinds services {:?}", name, dropped);
            }
            state.set_state(name, PluginState::Registered);
            plugin
        };

        if let Err(e) = plugin.enable(false) {
            warn!("Disabling {} failed: {}", name, e);
        }
        plugin.close()?;
        info!("Closed CA {}", name);
        Ok(())
    }

    /// Stop every service served by a plug-in, then close it.
    pub fn stop_ca(&self, name: &str) -> CaResult {
        let _ops = self.shared.ops.lock();
        let (plugin, sids) = {
            let mut state = self.shared.state.lock();
            let entry = state.find(name)?;
            if !entry.state.is_open() {
                return Err(CaError::NotOpen);
            }
            let plugin = Arc::clone(&entry.plugin);
            (plugin, state.drop_bindings_of(name))
        };

        for sid in sids {
            match plugin.stop_pmt(sid) {
                Ok(()) => info!("Stopped service {} on {}", sid, name),
                Err(e) => warn!("Stopping service {} on {} failed: {}", sid, name, e),
            }
        }
        self.close_ca(name)
    }

    /// Enable or disable message exchange for an open plug-in.
    pub fn enable_ca(&self, name: &str, enable: bool) -> CaResult {
        let _ops = self.shared.ops.lock();
        let (plugin, previous) = {
            let mut state = self.shared.state.lock();
            let entry = state.find_mut(name)?;
            if !entry.state.is_open() {
                return Err(CaError::NotOpen);
            }
            let previous = entry.state;
            entry.state = if enable {
                PluginState::Enabled
            } else {
                PluginState::Opened
            };
            (Arc::clone(&entry.plugin), previous)
        };

        if let Err(e) = plugin.enable(enable) {
            self.shared.state.lock().set_state(name, previous);
            return Err(e);
        }
        debug!("CA {} {}", name, if enable { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Send an application message to one plug-in, or to every enabled
    /// plug-in when `name` is `None`.
    ///
    /// A broadcast succeeds if at least one plug-in accepted the message.
    pub fn put_msg(&self, name: Option<&str>, msg: AppMessage) -> CaResult {
        match name {
            Some(name) => {
                let plugin = {
                    let state = self.shared.state.lock();
                    let entry = state.find(name)?;
                    match entry.state {
                        PluginState::Enabled => Arc::clone(&entry.plugin),
                        PluginState::Opened => return Err(CaError::Disabled(name.to_string())),
                        PluginState::Registered => return Err(CaError::NotOpen),
                    }
                };
                debug!("App -> {}: {}", name, msg.message_type().name());
                plugin.msg_receive(msg)
            }
            None => {
                let targets: Vec<(String, Arc<dyn CaPlugin>)> = {
                    let state = self.shared.state.lock();
                    state
                        .plugins
                        .iter()
                        .filter(|p| p.state == PluginState::Enabled)
                        .map(|p| (p.name.clone(), Arc::clone(&p.plugin)))
                        .collect()
                };

                let mut delivered = 0usize;
                let mut last_error = CaError::NotSupported;
                for (name, plugin) in targets {
                    match plugin.msg_receive(msg.clone()) {
                        Ok(()) => delivered += 1,
                        Err(CaError::NotSupported) => {}
                        Err(e) => {
                            warn!("{} rejected {}: {}", name, msg.message_type().name(), e);
                            last_error = e;
                        }
                    }
                }
                if delivered > 0 {
                    Ok(())
                } else {
                    Err(last_error)
                }
            }
        }
    }

    /// Take the oldest queued application message, optionally only from the
    /// plug-in `name`, waiting up to `timeout`.
    pub fn get_msg(&self, name: Option<&str>, timeout: Duration) -> CaResult<Message> {
        self.shared.bus.take(name, timeout)
    }

    /// Install (or with `None`, remove) a push callback for messages from
    /// plug-in `name`, or for every plug-in without its own callback when
    /// `name` is `None`.
    pub fn set_callback(&self, name: Option<&str>, callback: Option<MsgCallback>) {
        self.shared.bus.set_callback(name, callback);
    }

    /// Release a message obtained from [`get_msg`](Self::get_msg) or a
    /// callback. The producing plug-in frees it.
    pub fn free_msg(&self, msg: Message) {
        self.shared.free(msg);
    }

    /// Number of messages waiting for `get_msg`.
    pub fn queued_messages(&self) -> usize {
        self.shared.bus.queued()
    }

    /// Snapshot of every binding, ordered by service id.
    pub fn bindings(&self) -> Vec<ServiceBinding> {
        let state = self.shared.state.lock();
        let mut all: Vec<ServiceBinding> = state.bindings.values().cloned().collect();
        all.sort_by_key(|b| b.service_id);
        all
    }

    pub fn binding(&self, service_id: u16) -> Option<ServiceBinding> {
        self.shared.state.lock().bindings.get(&service_id).cloned()
    }

    /// Registered plug-ins in registration order.
    pub fn plugins(&self) -> Vec<PluginInfo> {
        self.shared
            .state
            .lock()
            .plugins
            .iter()
            .map(|p| PluginInfo {
                name: p.name.clone(),
                ca_type: p.ca_type,
                auto_match: p.options.auto_match,
                state: p.state,
            })
            .collect()
    }
}

impl Drop for CaManager {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Closing CA manager on drop failed: {}", e);
        }
    }
}
