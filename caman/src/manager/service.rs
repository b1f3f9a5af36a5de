//! Service binding and table monitoring.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::MutexGuard;

use caman_protocol::psi::PmtTable;
use caman_protocol::CaError;

use super::{CaManager, Deferred, PluginState, ServiceBinding};
use crate::plugin::{CaPlugin, CaResult, CaType, TableTiming, TsContext};
use crate::ts_analyzer::{TableEvent, TableMonitor};

impl CaManager {
    /// Start descrambling a service.
    ///
    /// With `forced` the named plug-in is used. Without it the first enabled,
    /// auto-matching plug-in (in registration order) that accepts one of the
    /// CA system ids of the service wins. Starting a service that is already
    /// bound re-delivers its current PMT as an update.
    pub fn start_service(&self, service_id: u16, forced: Option<&str>) -> CaResult {
        if !self.admit_start(service_id, forced)? {
            return Ok(());
        }

        // Table waits run without `ops` held.
        let waited = self.wait_for_pmt(service_id)?;
        let unbound = self.binding(service_id).and_then(|b| b.ca_name).is_none();
        if forced.is_none() && unbound {
            self.wait_for_cat(&waited);
        }

        let _ops = self.shared.ops.lock();
        if !self.admit_start(service_id, forced)? {
            return Ok(());
        }
        let mut pmt = self.current_pmt(service_id)?;
        loop {
            self.bind(service_id, forced, pmt.clone())?;
            // A PMT that arrived before the binding existed was not delivered.
            match self.current_pmt(service_id) {
                Ok(latest) if latest != pmt => pmt = latest,
                _ => return Ok(()),
            }
        }
    }

    /// Stop descrambling a service. Stopping a service that is not started
    /// succeeds without doing anything.
    pub fn stop_service(&self, service_id: u16) -> CaResult {
        let _ops = self.shared.ops.lock();
        let (binding, plugin) = {
            let mut state = self.shared.state.lock();
            if state.paused {
                debug!("Paused, deferring stop of service {}", service_id);
                defer(&mut state.deferred, Deferred::Stop { service_id });
                return Ok(());
            }
            let Some(binding) = state.bindings.remove(&service_id) else {
                debug!("Service {} is not started", service_id);
                return Ok(());
            };
            let plugin = binding
                .ca_name
                .as_deref()
                .and_then(|name| state.find(name).ok())
                .map(|entry| Arc::clone(&entry.plugin));
            (binding, plugin)
        };

        let (Some(name), Some(plugin)) = (binding.ca_name, plugin) else {
            info!("Stopped unscrambled service {}", service_id);
            return Ok(());
        };
        plugin.stop_pmt(service_id)?;
        info!("Stopped service {} on {}", service_id, name);
        Ok(())
    }

    /// Feed raw TS bytes. Discarded while paused.
    pub fn feed(&self, data: &[u8]) -> CaResult {
        if self.accepting_tables()? {
            let events = {
                let mut tables = self.shared.tables.lock();
                let events = tables.push_packets(data);
                self.shared.tables_changed.notify_all();
                events
            };
            self.handle_events(events);
        }
        Ok(())
    }

    /// Feed one complete PSI section (PAT, CAT or PMT). Discarded while
    /// paused.
    pub fn feed_section(&self, section: &[u8]) -> CaResult {
        if self.accepting_tables()? {
            let events = {
                let mut tables = self.shared.tables.lock();
                let events = tables.push_section(section)?;
                self.shared.tables_changed.notify_all();
                events
            };
            self.handle_events(events);
        }
        Ok(())
    }

    /// The tuner was retuned: drop every table and binding and tell every
    /// open plug-in.
    pub fn ts_changed(&self) -> CaResult {
        let _ops = self.shared.ops.lock();
        if !self.is_open() {
            return Err(CaError::NotOpen);
        }
        self.shared.tables.lock().reset();
        self.stream_changed();
        Ok(())
    }

    /// Services whose PMT has been received, ascending.
    pub fn known_services(&self) -> Vec<u16> {
        self.shared.tables.lock().services()
    }

    fn accepting_tables(&self) -> CaResult<bool> {
        let state = self.shared.state.lock();
        if state.ts.is_none() {
            return Err(CaError::NotOpen);
        }
        Ok(!state.paused)
    }

    fn handle_events(&self, events: Vec<TableEvent>) {
        for event in events {
            match event {
                TableEvent::PatChanged {
                    transport_stream_id,
                    previous: Some(previous),
                } => {
                    info!(
                        "Transport stream 0x{:04X} replaced 0x{:04X}",
                        transport_stream_id, previous
                    );
                    let _ops = self.shared.ops.lock();
                    self.stream_changed();
                }
                TableEvent::PatChanged { .. } => {}
                TableEvent::CatChanged { version, section } => {
                    let plugins = self.shared.state.lock().open_plugins();
                    debug!("CAT v{} to {} plug-ins", version, plugins.len());
                    for plugin in plugins {
                        plugin.new_cat(&section);
                    }
                }
                TableEvent::PmtChanged {
                    service_id,
                    version,
                    section,
                } => self.pmt_changed(service_id, version, section),
            }
        }
    }

    fn pmt_changed(&self, service_id: u16, version: u8, section: Vec<u8>) {
        if self.pending_update(service_id, &section).is_none() {
            return;
        }
        let _ops = self.shared.ops.lock();
        let Some(forced) = self.pending_update(service_id, &section) else {
            return;
        };

        info!("PMT of service {} updated to v{}", service_id, version);
        if let Err(e) = self.bind(service_id, forced.as_deref(), section) {
            warn!("Updating service {} failed: {}", service_id, e);
        }
    }

    /// `Some(forced)` when `service_id` is bound and `section` differs from
    /// the PMT last delivered for it.
    fn pending_update(&self, service_id: u16, section: &[u8]) -> Option<Option<String>> {
        let state = self.shared.state.lock();
        let binding = state
            .bindings
            .get(&service_id)
            .filter(|b| b.pmt != section)?;
        Some(binding.forced.then(|| binding.ca_name.clone()).flatten())
    }

    /// Recreate the stream context, drop bindings and notify plug-ins.
    fn stream_changed(&self) {
        let plugins = {
            let mut state = self.shared.state.lock();
            let Some(params) = state.ts.as_ref().map(|ts| ts.params) else {
                return;
            };
            state.generation += 1;
            state.ts = Some(TsContext {
                params,
                generation: state.generation,
            });
            if !state.bindings.is_empty() {
                warn!(
                    "Stream changed, dropping {} service bindings",
                    state.bindings.len()
                );
                state.bindings.clear();
            }
            state.open_plugins()
        };

        for plugin in plugins {
            plugin.ts_changed();
        }
    }

    fn bind(&self, service_id: u16, forced: Option<&str>, pmt: Vec<u8>) -> CaResult {
        let current = self
            .shared
            .state
            .lock()
            .bindings
            .get(&service_id)
            .and_then(|b| b.ca_name.clone());

        let target = match (forced, &current) {
            (Some(name), _) => Some(name.to_string()),
            (None, Some(name)) => Some(name.clone()),
            (None, None) => self.select_plugin(service_id, &pmt)?,
        };

        let Some(target) = target else {
            info!("Service {} carries no CA system, left unbound", service_id);
            self.shared.state.lock().bindings.insert(
                service_id,
                ServiceBinding {
                    service_id,
                    ca_name: None,
                    pmt,
                    seen: false,
                    forced: false,
                },
            );
            return Ok(());
        };

        let (plugin, ca_type) = self.enabled_plugin(&target)?;
        if let Some(previous) = current.as_deref().filter(|p| *p != target) {
            info!(
                "Moving service {} from {} to {}",
                service_id, previous, target
            );
            self.release(service_id, previous);
        }
        if ca_type == CaType::Ci {
            self.release_others(&target, service_id);
        }

        let update = current.as_deref() == Some(target.as_str());
        if let Err(e) = plugin.start_pmt(service_id, &pmt) {
            warn!(
                "{} rejected service {} ({}): {}",
                target,
                service_id,
                if update { "update" } else { "start" },
                e
            );
            return Err(e);
        }

        info!(
            "Service {} {} on {}",
            service_id,
            if update { "updated" } else { "started" },
            target
        );
        self.shared.state.lock().bindings.insert(
            service_id,
            ServiceBinding {
                service_id,
                ca_name: Some(target),
                pmt,
                seen: true,
                forced: forced.is_some(),
            },
        );
        Ok(())
    }

    /// Stop `service_id` on `name` and drop its binding.
    fn release(&self, service_id: u16, name: &str) {
        let plugin = {
            let mut state = self.shared.state.lock();
            state.bindings.remove(&service_id);
            state.find(name).ok().map(|e| Arc::clone(&e.plugin))
        };
        if let Some(plugin) = plugin {
            if let Err(e) = plugin.stop_pmt(service_id) {
                warn!("Stopping service {} on {} failed: {}", service_id, name, e);
            }
        }
    }

    /// A CI slot serves one service: stop whatever else `name` serves.
    fn release_others(&self, name: &str, service_id: u16) {
        let others: Vec<u16> = {
            let state = self.shared.state.lock();
            state
                .bindings
                .values()
                .filter(|b| b.service_id != service_id && b.ca_name.as_deref() == Some(name))
                .map(|b| b.service_id)
                .collect()
        };
        for other in others {
            info!("{} is single-service, stopping service {}", name, other);
            self.release(other, name);
        }
    }

    fn enabled_plugin(&self, name: &str) -> CaResult<(Arc<dyn CaPlugin>, CaType)> {
        let state = self.shared.state.lock();
        let entry = state.find(name)?;
        match entry.state {
            PluginState::Enabled => Ok((Arc::clone(&entry.plugin), entry.ca_type)),
            PluginState::Opened => Err(CaError::Disabled(name.to_string())),
            PluginState::Registered => Err(CaError::NotOpen),
        }
    }

    /// Pick the plug-in for a scrambled service. `Ok(None)` means the
    /// service is in the clear. CA systems announced in the CAT widen the
    /// match.
    fn select_plugin(&self, service_id: u16, pmt: &[u8]) -> CaResult<Option<String>> {
        let mut ids = PmtTable::from_bytes(pmt)?.ca_system_ids()?;
        if ids.is_empty() {
            return Ok(None);
        }
        let emm = self.shared.tables.lock().cat_ca_system_ids();
        for id in emm {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }

        if let Some(name) = self.first_match(&ids) {
            return Ok(Some(name));
        }
        warn!(
            "No CA plug-in matches service {} (CA systems {:04X?})",
            service_id, ids
        );
        Err(CaError::NotSupported)
    }

    /// Give the CAT up to its timeout when no plug-in matches the CA systems
    /// of `pmt` alone.
    fn wait_for_cat(&self, pmt: &[u8]) {
        if self.shared.tables.lock().cat().is_some() {
            return;
        }
        let Ok(ids) = PmtTable::from_bytes(pmt).and_then(|t| t.ca_system_ids()) else {
            return;
        };
        if ids.is_empty() || self.first_match(&ids).is_some() {
            return;
        }
        let Ok(timing) = self.timing(|ts| ts.params.cat) else {
            return;
        };
        if self.wait_tables(timing, |t| t.cat().is_some()).is_none() {
            debug!("No CAT within {:?}", timing.timeout);
        }
    }

    /// First enabled, auto-matching plug-in whose `camatch` accepts one of
    /// `ids`, in registration order.
    fn first_match(&self, ids: &[u16]) -> Option<String> {
        let candidates: Vec<(String, Arc<dyn CaPlugin>)> = {
            let state = self.shared.state.lock();
            state
                .plugins
                .iter()
                .filter(|p| p.state == PluginState::Enabled && p.options.auto_match)
                .map(|p| (p.name.clone(), Arc::clone(&p.plugin)))
                .collect()
        };

        candidates.into_iter().find_map(|(name, plugin)| {
            let matched = ids.iter().find(|id| plugin.camatch(**id))?;
            debug!("{} matches CA system 0x{:04X}", name, matched);
            Some(name)
        })
    }

    fn timing(&self, pick: impl Fn(&TsContext) -> TableTiming) -> CaResult<TableTiming> {
        self.shared
            .state
            .lock()
            .ts
            .as_ref()
            .map(pick)
            .ok_or(CaError::NotOpen)
    }

    /// Wait until `ready` holds, polling every `timing.poll` for at most
    /// `timing.timeout`. Returns the locked tables on success.
    fn wait_tables(
        &self,
        timing: TableTiming,
        ready: impl Fn(&TableMonitor) -> bool,
    ) -> Option<MutexGuard<'_, TableMonitor>> {
        let deadline = Instant::now() + timing.timeout;
        let mut tables = self.shared.tables.lock();
        loop {
            if ready(&tables) {
                return Some(tables);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let wait = timing.poll.min(deadline - now).max(Duration::from_millis(1));
            self.shared.tables_changed.wait_for(&mut tables, wait);
        }
    }

    /// The PMT of a service, waiting for the PAT and then the PMT.
    fn wait_for_pmt(&self, service_id: u16) -> CaResult<Vec<u8>> {
        let (pat, pmt) = {
            let state = self.shared.state.lock();
            let ts = state.ts.as_ref().ok_or(CaError::NotOpen)?;
            (ts.params.pat, ts.params.pmt)
        };

        let listed = |t: &TableMonitor| t.pmt(service_id).is_some() || t.pat_lists(service_id).is_some();
        let tables = self.wait_tables(pat, listed).ok_or(CaError::Timeout)?;
        if let Some(section) = tables.pmt(service_id) {
            return Ok(section.to_vec());
        }
        if tables.pat_lists(service_id) == Some(false) {
            return Err(CaError::BadParam(format!(
                "service {service_id} is not in the PAT"
            )));
        }
        drop(tables);

        let tables = self
            .wait_tables(pmt, |t| t.pmt(service_id).is_some())
            .ok_or(CaError::Timeout)?;
        tables
            .pmt(service_id)
            .map(<[u8]>::to_vec)
            .ok_or(CaError::Timeout)
    }

    /// The PMT the table monitor holds now. Gone after a retune.
    fn current_pmt(&self, service_id: u16) -> CaResult<Vec<u8>> {
        self.shared
            .tables
            .lock()
            .pmt(service_id)
            .map(<[u8]>::to_vec)
            .ok_or(CaError::Timeout)
    }

    /// `Ok(false)` when the request was recorded for replay on resume.
    fn admit_start(&self, service_id: u16, forced: Option<&str>) -> CaResult<bool> {
        let mut state = self.shared.state.lock();
        if state.ts.is_none() {
            return Err(CaError::NotOpen);
        }
        if let Some(name) = forced {
            state.find(name)?;
        }
        if state.paused {
            debug!("Paused, deferring start of service {}", service_id);
            defer(
                &mut state.deferred,
                Deferred::Start {
                    service_id,
                    forced: forced.map(str::to_string),
                },
            );
            return Ok(false);
        }
        Ok(true)
    }
}

/// Record a request made while paused; a later request for the same service
/// replaces an earlier one.
fn defer(queue: &mut Vec<Deferred>, request: Deferred) {
    queue.retain(|r| r.service_id() != request.service_id());
    queue.push(request);
}
