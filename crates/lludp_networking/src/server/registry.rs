//! Circuit lookup by code, remote address and agent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::circuit::{Circuit, CircuitCode, CircuitIdentity, CircuitState};
use crate::objects::{ObjectUpdateQueue, ObjectUpdateScheduler};
use crate::scheduler::TransmitScheduler;

/// Workers driven by [`crate::LludpServer::pump`] instead of threads.
pub(crate) struct ManualWorkers {
    pub(crate) transmit: TransmitScheduler,
    pub(crate) updates: ObjectUpdateScheduler,
}

/// A registered circuit and what hangs off it.
pub(crate) struct CircuitEntry {
    pub(crate) circuit: Arc<Circuit>,
    pub(crate) updates: Arc<ObjectUpdateQueue>,
    pub(crate) manual: Mutex<Option<ManualWorkers>>,
    entered: AtomicBool,
}

impl CircuitEntry {
    pub(crate) fn new(circuit: Arc<Circuit>) -> Self {
        Self {
            circuit,
            updates: Arc::new(ObjectUpdateQueue::new()),
            manual: Mutex::new(None),
            entered: AtomicBool::new(false),
        }
    }

    /// Marks the region entry as done. True only for the first call.
    pub(crate) fn mark_entered(&self) -> bool {
        !self.entered.swap(true, Ordering::AcqRel)
    }

    /// Runs one pass of manually driven workers.
    pub(crate) fn pump(&self) {
        if let Some(workers) = self.manual.lock().as_mut() {
            workers.updates.run_pass();
            workers.transmit.pump();
        }
    }
}

#[derive(Default)]
struct Maps {
    by_code: HashMap<CircuitCode, Arc<CircuitEntry>>,
    by_addr: HashMap<SocketAddr, Arc<CircuitEntry>>,
    by_agent: HashMap<Uuid, CircuitCode>,
}

/// All circuits of one server behind a single lock.
#[derive(Default)]
pub(crate) struct CircuitRegistry {
    maps: RwLock<Maps>,
}

impl CircuitRegistry {
    /// Adds a pending circuit. Returns the entry it displaced, if any.
    pub(crate) fn insert(&self, entry: Arc<CircuitEntry>) -> Option<Arc<CircuitEntry>> {
        let identity = *entry.circuit.identity();
        let mut maps = self.maps.write();
        maps.by_agent.insert(identity.agent_id, identity.code);
        let previous = maps.by_code.insert(identity.code, entry);
        if let Some(addr) = previous.as_ref().and_then(|p| p.circuit.remote_addr()) {
            maps.by_addr.remove(&addr);
        }
        previous
    }

    /// Binds `addr` to the pending circuit whose identity matches exactly.
    ///
    /// The lookup, activation and address insertion happen under one write
    /// lock, so two handshakes can never bind the same circuit.
    pub(crate) fn bind(
        &self,
        code: CircuitCode,
        session_id: &Uuid,
        agent_id: &Uuid,
        addr: SocketAddr,
    ) -> Option<Arc<CircuitEntry>> {
        let mut maps = self.maps.write();
        if maps.by_addr.contains_key(&addr) {
            return None;
        }
        let entry = maps.by_code.get(&code)?.clone();
        let identity = entry.circuit.identity();
        if identity.session_id != *session_id
            || identity.agent_id != *agent_id
            || entry.circuit.state() != CircuitState::Pending
        {
            return None;
        }
        if !entry.circuit.activate(addr) {
            return None;
        }
        maps.by_addr.insert(addr, entry.clone());
        Some(entry)
    }

    /// Removes every key of a circuit, if it is still the registered one.
    pub(crate) fn remove(&self, identity: &CircuitIdentity) -> Option<Arc<CircuitEntry>> {
        let code = identity.code;
        let mut maps = self.maps.write();
        if maps.by_code.get(&code)?.circuit.identity() != identity {
            return None;
        }
        let entry = maps.by_code.remove(&code)?;
        if let Some(addr) = entry.circuit.remote_addr() {
            if maps
                .by_addr
                .get(&addr)
                .is_some_and(|bound| Arc::ptr_eq(bound, &entry))
            {
                maps.by_addr.remove(&addr);
            }
        }
        let agent = entry.circuit.identity().agent_id;
        if maps.by_agent.get(&agent) == Some(&code) {
            maps.by_agent.remove(&agent);
        }
        Some(entry)
    }

    pub(crate) fn by_addr(&self, addr: &SocketAddr) -> Option<Arc<CircuitEntry>> {
        self.maps.read().by_addr.get(addr).cloned()
    }

    pub(crate) fn by_code(&self, code: CircuitCode) -> Option<Arc<CircuitEntry>> {
        self.maps.read().by_code.get(&code).cloned()
    }

    pub(crate) fn by_agent(&self, agent_id: &Uuid) -> Option<Arc<CircuitEntry>> {
        let maps = self.maps.read();
        let code = maps.by_agent.get(agent_id)?;
        maps.by_code.get(code).cloned()
    }

    /// Snapshot of every entry, so callers never hold the lock while working.
    pub(crate) fn entries(&self) -> Vec<Arc<CircuitEntry>> {
        self.maps.read().by_code.values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.maps.read().by_code.len()
    }

    pub(crate) fn bound_len(&self) -> usize {
        self.maps.read().by_addr.len()
    }
}
