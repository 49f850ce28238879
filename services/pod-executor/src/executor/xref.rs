//! Task / container cross-reference table.
//!
//! Four maps behind one lock:
//! - task id -> container name
//! - container name -> task id
//! - task id -> task descriptor
//! - container name -> runtime info
//!
//! Every mutation touches all four maps under the same guard, so an entry
//! in one map always has its counterparts in the other three.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use podex_id::TaskId;
use podex_proto::TaskInfo;

use crate::task::RuntimeInfo;

#[derive(Debug, Default)]
struct Tables {
    task_to_container: BTreeMap<TaskId, String>,
    container_to_task: BTreeMap<String, TaskId>,
    tasks: BTreeMap<TaskId, TaskInfo>,
    runtimes: BTreeMap<String, RuntimeInfo>,
}

#[derive(Debug, Default)]
pub struct CrossRef {
    tables: Mutex<Tables>,
}

impl CrossRef {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Links a task to its container, replacing any previous link of either.
    pub fn set_container_with_task_id(&self, task: TaskInfo, container: &str, runtime: RuntimeInfo) {
        let mut t = self.lock();
        let task_id = task.task_id.clone();

        if let Some(old_container) = t.task_to_container.remove(&task_id) {
            t.container_to_task.remove(&old_container);
            t.runtimes.remove(&old_container);
        }
        if let Some(old_task) = t.container_to_task.remove(container) {
            t.task_to_container.remove(&old_task);
            t.tasks.remove(&old_task);
        }

        t.task_to_container.insert(task_id.clone(), container.to_string());
        t.container_to_task.insert(container.to_string(), task_id.clone());
        t.tasks.insert(task_id, task);
        t.runtimes.insert(container.to_string(), runtime);
    }

    pub fn clean_task(&self, task_id: &TaskId) {
        let mut t = self.lock();
        t.tasks.remove(task_id);
        if let Some(container) = t.task_to_container.remove(task_id) {
            t.container_to_task.remove(&container);
            t.runtimes.remove(&container);
        }
    }

    pub fn clean_container(&self, container: &str) {
        let mut t = self.lock();
        t.runtimes.remove(container);
        if let Some(task_id) = t.container_to_task.remove(container) {
            t.task_to_container.remove(&task_id);
            t.tasks.remove(&task_id);
        }
    }

    pub fn clean(&self) {
        *self.lock() = Tables::default();
    }

    pub fn container_for(&self, task_id: &TaskId) -> Option<String> {
        self.lock().task_to_container.get(task_id).cloned()
    }

    pub fn task_for(&self, container: &str) -> Option<TaskId> {
        self.lock().container_to_task.get(container).cloned()
    }

    pub fn task(&self, task_id: &TaskId) -> Option<TaskInfo> {
        self.lock().tasks.get(task_id).cloned()
    }

    pub fn contains_task(&self, task_id: &TaskId) -> bool {
        self.lock().tasks.contains_key(task_id)
    }

    pub fn runtime(&self, container: &str) -> Option<RuntimeInfo> {
        self.lock().runtimes.get(container).cloned()
    }

    /// Replaces the stored runtime info; unknown containers are ignored.
    pub fn update_runtime(&self, runtime: &RuntimeInfo) -> bool {
        let mut t = self.lock();
        match t.runtimes.get_mut(&runtime.name) {
            Some(slot) => {
                *slot = runtime.clone();
                true
            }
            None => false,
        }
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.lock().tasks.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks that the four maps agree.
    pub fn check_invariant(&self) -> Result<(), String> {
        let t = self.lock();
        let sizes = [
            t.task_to_container.len(),
            t.container_to_task.len(),
            t.tasks.len(),
            t.runtimes.len(),
        ];
        if sizes.iter().any(|s| *s != sizes[0]) {
            return Err(format!("map sizes differ: {sizes:?}"));
        }
        for (task_id, container) in &t.task_to_container {
            if t.container_to_task.get(container) != Some(task_id) {
                return Err(format!("{task_id} -> {container} has no reverse entry"));
            }
            if !t.tasks.contains_key(task_id) {
                return Err(format!("{task_id} has no descriptor"));
            }
            if !t.runtimes.contains_key(container) {
                return Err(format!("{container} has no runtime info"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ContainerTaskSpec;
    use podex_testing::TaskBuilder;
    use proptest::prelude::*;

    fn link(xref: &CrossRef, task: &str, container: &str) {
        let info = TaskBuilder::new(task).build();
        let spec = ContainerTaskSpec::new(info.task_id.clone(), task, container, "busybox");
        xref.set_container_with_task_id(info, container, spec.runtime);
    }

    #[test]
    fn test_link_and_lookup() {
        let xref = CrossRef::new();
        link(&xref, "web", "c-web");
        link(&xref, "db", "c-db");

        let web = TaskId::parse("web.task").unwrap();
        assert_eq!(xref.container_for(&web).as_deref(), Some("c-web"));
        assert_eq!(xref.task_for("c-db"), Some(TaskId::parse("db.task").unwrap()));
        assert_eq!(xref.len(), 2);
        xref.check_invariant().unwrap();

        xref.clean_task(&web);
        assert!(xref.container_for(&web).is_none());
        assert!(xref.runtime("c-web").is_none());
        xref.check_invariant().unwrap();

        xref.clean_container("c-db");
        assert!(xref.is_empty());
        xref.check_invariant().unwrap();
    }

    #[test]
    fn test_relink_replaces_both_sides() {
        let xref = CrossRef::new();
        link(&xref, "web", "c1");
        link(&xref, "web", "c2");
        link(&xref, "db", "c2");
        xref.check_invariant().unwrap();
        assert_eq!(xref.len(), 1);
        assert!(!xref.contains_task(&TaskId::parse("web.task").unwrap()));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Set(u8, u8),
        CleanTask(u8),
        CleanContainer(u8),
        Clean,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            6 => (0u8..6, 0u8..6).prop_map(|(t, c)| Op::Set(t, c)),
            2 => (0u8..6).prop_map(Op::CleanTask),
            2 => (0u8..6).prop_map(Op::CleanContainer),
            1 => Just(Op::Clean),
        ]
    }

    proptest! {
        #[test]
        fn test_invariant_holds_after_every_op(ops in proptest::collection::vec(op(), 1..40)) {
            let xref = CrossRef::new();
            for op in ops {
                match op {
                    Op::Set(t, c) => link(&xref, &format!("t{t}"), &format!("c{c}")),
                    Op::CleanTask(t) => xref.clean_task(&TaskId::parse(&format!("t{t}.task")).unwrap()),
                    Op::CleanContainer(c) => xref.clean_container(&format!("c{c}")),
                    Op::Clean => xref.clean(),
                }
                prop_assert!(xref.check_invariant().is_ok(), "{:?}", xref.check_invariant());
            }
        }
    }
}
