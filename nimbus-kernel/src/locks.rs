use crate::state::{new_state, Shared};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Verrous d'exclusion par VM : deux pipelines sur le même id ne peuvent
/// pas s'entrelacer dans ce processus. Le statut d'installation persisté
/// reste la garde entre processus.
#[derive(Clone)]
pub struct VmLocks {
    inner: Shared<HashMap<String, Arc<Mutex<()>>>>,
}

impl VmLocks {
    pub fn new() -> Self {
        Self { inner: new_state(HashMap::new()) }
    }

    pub fn lock_for(&self, vm_id: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock();
        map.entry(vm_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl Default for VmLocks {
    fn default() -> Self {
        Self::new()
    }
}
