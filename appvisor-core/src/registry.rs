use std::collections::HashMap;

use crate::app::App;
use crate::config::ConfigStore;
use crate::process::ProcState;

/// Identifies one connected control-plane client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

/// Opaque token granting a client override authority over one app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub u64);

#[derive(Debug)]
struct Entry {
    app: App,
    active: bool,
}

/// All known app containers, split into active (running or stopping) and
/// inactive, plus the client handle table.
///
/// Every app is in exactly one of the two sets; the `active` flag on the
/// entry is the single source of truth for membership.
#[derive(Debug, Default)]
pub struct Registry {
    apps: HashMap<String, Entry>,
    handles: HashMap<HandleId, (String, SessionId)>,
    next_handle: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds the app container, creating it from configuration if this is
    /// the first reference. A name with no configuration is not installed.
    pub fn get_or_create(&mut self, config: &ConfigStore, name: &str) -> crate::Result<&mut App> {
        if !self.apps.contains_key(name) {
            let app_config = config
                .app(name)
                .ok_or_else(|| crate::Error::NotInstalled(name.to_string()))?;
            self.apps.insert(
                name.to_string(),
                Entry { app: App::new(app_config.clone()), active: false },
            );
        }
        Ok(&mut self.apps.get_mut(name).unwrap().app)
    }

    pub fn app(&self, name: &str) -> Option<&App> {
        self.apps.get(name).map(|e| &e.app)
    }

    pub fn app_mut(&mut self, name: &str) -> Option<&mut App> {
        self.apps.get_mut(name).map(|e| &mut e.app)
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.apps.get(name).is_some_and(|e| e.active)
    }

    pub fn active_app_mut(&mut self, name: &str) -> Option<&mut App> {
        self.apps
            .get_mut(name)
            .filter(|e| e.active)
            .map(|e| &mut e.app)
    }

    pub fn activate(&mut self, name: &str) {
        if let Some(entry) = self.apps.get_mut(name) {
            entry.active = true;
        }
    }

    pub fn deactivate(&mut self, name: &str) {
        if let Some(entry) = self.apps.get_mut(name) {
            entry.active = false;
        }
    }

    /// Active app owning the given PID, if any. Only active apps can own
    /// live processes.
    pub fn app_owning_pid(&self, pid: i32) -> Option<&str> {
        self.apps
            .iter()
            .find(|(_, e)| e.active && e.app.owns_pid(pid))
            .map(|(name, _)| name.as_str())
    }

    pub fn any_active(&self) -> bool {
        self.apps.values().any(|e| e.active)
    }

    pub fn next_active_name(&self) -> Option<String> {
        self.apps
            .iter()
            .find(|(_, e)| e.active)
            .map(|(name, _)| name.clone())
    }

    /// Removes an inactive app container. Returns None if the app is active
    /// or unknown.
    pub fn remove_inactive(&mut self, name: &str) -> Option<App> {
        if self.apps.get(name)?.active {
            return None;
        }
        self.handles.retain(|_, (app, _)| app != name);
        self.apps.remove(name).map(|e| e.app)
    }

    /// Removes an app container regardless of state, for the shutdown path.
    pub fn remove(&mut self, name: &str) -> Option<App> {
        self.handles.retain(|_, (app, _)| app != name);
        self.apps.remove(name).map(|e| e.app)
    }

    pub fn remove_all_inactive(&mut self) -> Vec<String> {
        let names: Vec<String> = self
            .apps
            .iter()
            .filter(|(_, e)| !e.active)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            self.remove_inactive(name);
        }
        names
    }

    /// Grants the override handle for an app. At most one client may hold a
    /// handle per app at any time.
    pub fn create_handle(
        &mut self,
        config: &ConfigStore,
        name: &str,
        session: SessionId,
    ) -> crate::Result<HandleId> {
        let app = self.get_or_create(config, name)?;
        if app.owner().is_some() {
            return Err(crate::Error::AlreadyReferenced(name.to_string()));
        }
        app.set_owner(session);

        self.next_handle += 1;
        let handle = HandleId(self.next_handle);
        self.handles.insert(handle, (name.to_string(), session));
        Ok(handle)
    }

    /// Looks up the app a handle refers to, checking the caller owns it.
    pub fn handle_app(&self, handle: HandleId, session: SessionId) -> Option<&str> {
        self.handles
            .get(&handle)
            .filter(|(_, owner)| *owner == session)
            .map(|(app, _)| app.as_str())
    }

    /// Invalidates a handle and reverts every override it carried.
    pub fn release_handle(&mut self, handle: HandleId, session: SessionId) -> Option<String> {
        let (name, _) = self
            .handles
            .get(&handle)
            .filter(|(_, owner)| *owner == session)?
            .clone();
        self.handles.remove(&handle);
        if let Some(app) = self.app_mut(&name) {
            app.release_handle();
        }
        Some(name)
    }

    /// Cleans up after a disconnected client: handles are released with
    /// their overrides, and processes the client injected are removed.
    /// Returns the PIDs of injected processes that are still running and
    /// must be killed; their objects are dropped once the exits are reaped.
    pub fn drop_session(&mut self, session: SessionId) -> Vec<i32> {
        let released: Vec<HandleId> = self
            .handles
            .iter()
            .filter(|(_, (_, owner))| *owner == session)
            .map(|(h, _)| *h)
            .collect();
        for handle in released {
            self.release_handle(handle, session);
        }

        let mut doomed = Vec::new();
        for entry in self.apps.values_mut() {
            let names: Vec<String> = entry
                .app
                .procs()
                .filter(|p| p.injected_by() == Some(session))
                .map(|p| p.name().to_string())
                .collect();
            for name in names {
                let proc = entry.app.proc_mut(&name).unwrap();
                if proc.state() == ProcState::Running {
                    doomed.push(proc.pid().unwrap());
                    proc.orphan();
                } else {
                    entry.app.remove_proc(&name);
                }
            }
        }
        doomed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;
    use crate::process::Proc;

    fn test_store() -> ConfigStore {
        let config: SystemConfig = serde_json::from_str(
            r#"{
                "apps": [
                    {"name": "alpha", "procs": [{"name": "a1", "command": "/bin/a1"}]},
                    {"name": "beta", "procs": [{"name": "b1", "command": "/bin/b1"}]}
                ]
            }"#,
        )
        .unwrap();
        ConfigStore::from_config(config)
    }

    #[test]
    fn test_lazy_creation_and_not_installed() {
        let store = test_store();
        let mut registry = Registry::new();

        assert!(registry.app("alpha").is_none());
        registry.get_or_create(&store, "alpha").unwrap();
        assert!(registry.app("alpha").is_some());
        assert!(!registry.is_active("alpha"));

        assert!(matches!(
            registry.get_or_create(&store, "ghost"),
            Err(crate::Error::NotInstalled(_))
        ));
    }

    #[test]
    fn test_active_inactive_exclusivity() {
        let store = test_store();
        let mut registry = Registry::new();
        registry.get_or_create(&store, "alpha").unwrap();

        assert!(!registry.is_active("alpha"));
        registry.activate("alpha");
        assert!(registry.is_active("alpha"));
        assert!(registry.any_active());

        // An active app cannot be removed through the inactive path.
        assert!(registry.remove_inactive("alpha").is_none());

        registry.deactivate("alpha");
        assert!(!registry.any_active());
        assert!(registry.remove_inactive("alpha").is_some());
        assert!(registry.app("alpha").is_none());
    }

    #[test]
    fn test_pid_lookup_covers_active_apps_only() {
        let store = test_store();
        let mut registry = Registry::new();
        registry.get_or_create(&store, "alpha").unwrap();
        registry.activate("alpha");
        registry
            .app_mut("alpha")
            .unwrap()
            .proc_mut("a1")
            .unwrap()
            .started(321);

        assert_eq!(registry.app_owning_pid(321), Some("alpha"));
        registry.deactivate("alpha");
        assert_eq!(registry.app_owning_pid(321), None);
    }

    #[test]
    fn test_single_handle_per_app() {
        let store = test_store();
        let mut registry = Registry::new();

        let h1 = registry.create_handle(&store, "alpha", SessionId(1)).unwrap();
        assert!(matches!(
            registry.create_handle(&store, "alpha", SessionId(2)),
            Err(crate::Error::AlreadyReferenced(_))
        ));

        // The owner can look it up; another session cannot.
        assert_eq!(registry.handle_app(h1, SessionId(1)), Some("alpha"));
        assert_eq!(registry.handle_app(h1, SessionId(2)), None);

        registry.release_handle(h1, SessionId(1)).unwrap();
        assert!(registry.create_handle(&store, "alpha", SessionId(2)).is_ok());
    }

    #[test]
    fn test_release_reverts_overrides() {
        let store = test_store();
        let mut registry = Registry::new();

        let h = registry.create_handle(&store, "alpha", SessionId(1)).unwrap();
        registry
            .app_mut("alpha")
            .unwrap()
            .proc_mut("a1")
            .unwrap()
            .set_run_override(false);

        registry.release_handle(h, SessionId(1));
        assert!(registry.app("alpha").unwrap().proc("a1").unwrap().effective_run());
    }

    #[test]
    fn test_drop_session_releases_handles_and_injected_procs() {
        let store = test_store();
        let mut registry = Registry::new();

        registry.create_handle(&store, "alpha", SessionId(9)).unwrap();

        let app = registry.app_mut("alpha").unwrap();
        let spec = serde_json::from_str(r#"{"name": "dbg", "command": "/bin/dbg"}"#).unwrap();
        app.add_proc(Proc::new_injected(spec, SessionId(9))).unwrap();
        app.proc_mut("dbg").unwrap().started(555);

        let spec = serde_json::from_str(r#"{"name": "idle", "command": "/bin/idle"}"#).unwrap();
        app.add_proc(Proc::new_injected(spec, SessionId(9))).unwrap();

        let doomed = registry.drop_session(SessionId(9));

        // The running injected proc is reported for killing and kept until
        // its exit is reaped; the stopped one is gone already.
        assert_eq!(doomed, vec![555]);
        let app = registry.app("alpha").unwrap();
        assert!(app.proc("dbg").is_some_and(|p| p.remove_on_exit()));
        assert!(app.proc("idle").is_none());

        // Handle was released with the session.
        assert_eq!(app.owner(), None);
        assert!(registry.create_handle(&store, "alpha", SessionId(2)).is_ok());
    }
}
