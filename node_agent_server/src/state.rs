use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use tracing::{debug, info};

use node_agent_common::NodeError::{DuplicateProcess, UnknownProcess};
use node_agent_common::{
    now_millis, NodeError, OutputListener, ProcessDescription, ProcessId,
    RemoteListenableConfig, EXIT_UNAVAILABLE,
};

use crate::config::SupervisorConfig;
use crate::launch::parse_description;
use crate::process::{DestroyedCallback, RemoteProcess};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// Name reserved while the process launches.
    Loading(ProcessId),
    Running(ProcessId),
}

impl Slot {
    fn id(self) -> ProcessId {
        match self {
            Slot::Loading(id) | Slot::Running(id) => id,
        }
    }
}

struct NameEntry {
    description: ProcessDescription,
    slot: Slot,
}

/// Active names; a name leaves once its process is destroyed.
#[derive(Default)]
struct Names {
    entries: Mutex<HashMap<String, NameEntry>>,
    changed: Condvar,
}

impl Names {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, NameEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Running id for `name`, waiting out a launch in progress.
    fn running(&self, name: &str) -> Option<ProcessId> {
        let entries = self
            .changed
            .wait_while(self.lock(), |entries| {
                matches!(entries.get(name), Some(NameEntry { slot: Slot::Loading(_), .. }))
            })
            .unwrap_or_else(PoisonError::into_inner);
        match entries.get(name)?.slot {
            Slot::Running(id) => Some(id),
            Slot::Loading(_) => None,
        }
    }

    fn retire(&self, name: &str, id: ProcessId) {
        let mut entries = self.lock();
        if matches!(entries.get(name), Some(entry) if entry.slot.id() == id) {
            entries.remove(name);
            self.changed.notify_all();
        }
    }
}

/// Host-wide registry of supervised processes.
///
/// Names are unique among running processes. Handles stay addressable by
/// `ProcessId` after they are destroyed, so their terminal state can still
/// be read, until they are released.
pub struct ProcessManager {
    config: SupervisorConfig,
    default_properties: BTreeMap<String, String>,
    names: Arc<Names>,
    processes: RwLock<HashMap<ProcessId, RemoteProcess>>,

    next_process_id: RwLock<ProcessId>,
}

impl ProcessManager {
    pub fn new(config: SupervisorConfig, default_properties: BTreeMap<String, String>) -> Self {
        Self {
            config,
            default_properties,
            names: Arc::new(Names::default()),
            processes: RwLock::new(HashMap::new()),
            next_process_id: RwLock::new(0),
        }
    }

    fn take_proc_id(&self) -> Result<ProcessId, NodeError> {
        let mut next_process_id = self.next_process_id.write()?;
        let process_id = *next_process_id;
        *next_process_id += 1;
        Ok(process_id)
    }

    /// Milliseconds on the host clock.
    pub fn ping(&self) -> u64 {
        now_millis()
    }

    /// Launch a process under a name no running process holds.
    ///
    /// `listener`, if any, is registered under the config's listener id.
    pub fn create_remote_process(
        &self,
        description: ProcessDescription,
        config: &RemoteListenableConfig,
        listener: Option<Arc<dyn OutputListener>>,
    ) -> Result<(ProcessId, RemoteProcess), NodeError> {
        description.validate()?;
        let command = parse_description(&description, &self.default_properties)?;
        let name = description.name().to_string();
        let id = self.take_proc_id()?;

        {
            let mut entries = self.names.lock();
            if entries.contains_key(&name) {
                return Err(DuplicateProcess(name));
            }
            entries.insert(
                name.clone(),
                NameEntry {
                    description: description.clone(),
                    slot: Slot::Loading(id),
                },
            );
        }

        let names = Arc::downgrade(&self.names);
        let retired_name = name.clone();
        let on_destroyed: DestroyedCallback = Box::new(move |_code| {
            if let Some(names) = Weak::upgrade(&names) {
                names.retire(&retired_name, id);
            }
        });
        let launched = RemoteProcess::spawn(
            description,
            &command,
            config,
            listener,
            self.config.clone(),
            Some(on_destroyed),
        );

        let mut entries = self.names.lock();
        let result = match launched {
            Ok(process) => {
                // a process that finished during launch has already retired its name
                if let Some(entry) = entries.get_mut(&name) {
                    if entry.slot == Slot::Loading(id) {
                        entry.slot = Slot::Running(id);
                    }
                }
                self.processes.write()?.insert(id, process.clone());
                info!(process = %name, id, pid = process.pid(), "Created remote process");
                Ok((id, process))
            }
            Err(e) => {
                if matches!(entries.get(&name), Some(entry) if entry.slot == Slot::Loading(id)) {
                    entries.remove(&name);
                }
                Err(e)
            }
        };
        self.names.changed.notify_all();
        result
    }

    /// Destroy the named process; `EXIT_UNAVAILABLE` if there is none.
    pub fn kill_remote_process(&self, name: &str) -> i32 {
        let Some((_, process)) = self.get_remote_process(name) else {
            debug!(process = %name, "No such process to kill");
            return EXIT_UNAVAILABLE;
        };
        process.destroy()
    }

    /// Description of a running (or launching) process.
    pub fn get_process_description(&self, name: &str) -> Option<ProcessDescription> {
        self.names
            .lock()
            .get(name)
            .map(|entry| entry.description.clone())
    }

    pub fn get_remote_process(&self, name: &str) -> Option<(ProcessId, RemoteProcess)> {
        let id = self.names.running(name)?;
        let process = self.processes.read().ok()?.get(&id)?.clone();
        Some((id, process))
    }

    /// Descriptions of active processes, in name order, optionally limited
    /// to one group.
    pub fn list_process_descriptions(&self, group: Option<&str>) -> Vec<ProcessDescription> {
        let entries = self.names.lock();
        let mut descriptions: Vec<ProcessDescription> = entries
            .values()
            .map(|entry| &entry.description)
            .filter(|d| group.is_none() || d.group() == group)
            .cloned()
            .collect();
        descriptions.sort_by(|a, b| a.name().cmp(b.name()));
        descriptions
    }

    pub fn process(&self, id: ProcessId) -> Result<RemoteProcess, NodeError> {
        self.processes
            .read()?
            .get(&id)
            .cloned()
            .ok_or_else(|| UnknownProcess(id.to_string()))
    }

    /// Forget a destroyed process handle.
    pub fn release_process(&self, id: ProcessId) -> Result<(), NodeError> {
        let mut processes = self.processes.write()?;
        match processes.get(&id) {
            None => Err(UnknownProcess(id.to_string())),
            Some(process) if process.is_alive() => Err(NodeError::InvalidArgument(format!(
                "Process {} ({}) is still running",
                id,
                process.name()
            ))),
            Some(_) => {
                processes.remove(&id);
                Ok(())
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use node_agent_common::{OutputPolicy, EXIT_KILLED};
    use std::time::Duration;

    fn manager() -> ProcessManager {
        let config = SupervisorConfig {
            destroy_timeout: Duration::from_millis(500),
            ..SupervisorConfig::default()
        };
        ProcessManager::new(config, BTreeMap::new())
    }

    fn shell(name: &str, group: &str, script: &str) -> ProcessDescription {
        ProcessDescription::new(name)
            .unwrap()
            .with_group(group)
            .with_args(["/bin/sh", "-c", script])
    }

    fn config() -> RemoteListenableConfig {
        RemoteListenableConfig::new(OutputPolicy::default())
    }

    #[test]
    fn test_duplicate_name_rejected_while_running() {
        let m = manager();
        let (id, _) = m
            .create_remote_process(shell("A", "g", "exec sleep 30"), &config(), None)
            .unwrap();
        let err = m
            .create_remote_process(shell("A", "g", "true"), &config(), None)
            .err()
            .unwrap();
        assert_eq!(err, DuplicateProcess("A".to_string()));

        assert_eq!(m.kill_remote_process("A"), EXIT_KILLED);
        assert!(m.get_process_description("A").is_none());
        assert!(!m.process(id).unwrap().is_alive());

        // the name is free again
        let (second, _) = m
            .create_remote_process(shell("A", "g", "true"), &config(), None)
            .unwrap();
        assert_ne!(id, second);
    }

    #[test]
    fn test_kill_unknown() {
        assert_eq!(manager().kill_remote_process("nobody"), EXIT_UNAVAILABLE);
    }

    #[test]
    fn test_list_by_group() {
        let m = manager();
        for (name, group) in [("b", "x"), ("a", "x"), ("c", "y")] {
            m.create_remote_process(shell(name, group, "exec sleep 30"), &config(), None)
                .unwrap();
        }
        let names = |group| {
            m.list_process_descriptions(group)
                .iter()
                .map(|d| d.name().to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(names(None), vec!["a", "b", "c"]);
        assert_eq!(names(Some("x")), vec!["a", "b"]);
        assert!(names(Some("z")).is_empty());
        for name in ["a", "b", "c"] {
            m.kill_remote_process(name);
        }
        assert!(names(None).is_empty());
    }

    #[test]
    fn test_finished_process_releases_name_and_handle() {
        let m = manager();
        let (id, process) = m
            .create_remote_process(shell("quick", "g", "exit 2"), &config(), None)
            .unwrap();
        assert_eq!(process.wait_for(None), 2);
        assert!(m.get_remote_process("quick").is_none());
        assert_eq!(m.process(id).unwrap().exit_value(), 2);

        m.release_process(id).unwrap();
        assert!(matches!(m.process(id), Err(UnknownProcess(_))));
        assert!(matches!(m.release_process(id), Err(UnknownProcess(_))));
    }

    #[test]
    fn test_bad_description_frees_name() {
        let m = manager();
        let empty = ProcessDescription::new("empty").unwrap();
        assert!(m.create_remote_process(empty, &config(), None).is_err());
        let missing = ProcessDescription::new("missing")
            .unwrap()
            .with_args(["/nonexistent/program"]);
        assert!(matches!(
            m.create_remote_process(missing, &config(), None),
            Err(NodeError::ProcessStartFailure(_))
        ));
        assert!(m.get_process_description("missing").is_none());
    }
}
