//! A scriptable fake daemon implementing [`DbHandler`], standing in for
//! `PostgresHandler` so `HaCycle::run_cycle` can be driven in tests
//! without a real database process.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use governor_ha::db::DbHandler;
use governor_ha::error::StateError;
use governor_ha::kv::{KvClient, Member};

/// Shared, inspectable state behind a [`FakeDb`] handle. Cloning a
/// `FakeDb` (via [`FakeDb::handle`]) shares this state, so a test can
/// retain a handle after moving the boxed trait object into `HaCycle`.
#[derive(Default)]
struct Inner {
    data_directory_empty: bool,
    healthy: bool,
    leader: bool,
    optime: i64,
    maximum_lag: i64,

    promote_calls: u32,
    demote_calls: u32,
    follow_leader_calls: u32,
    follow_no_leader_calls: u32,
    slots: Vec<String>,
}

/// A scriptable fake implementing [`DbHandler`]. Construct with
/// [`FakeDb::new`], tune its starting state with the builder methods,
/// then keep a [`FakeDb::handle`] clone around to inspect call counts
/// and state after handing the original off to `HaCycle::new` as a
/// `Box<dyn DbHandler>`.
#[derive(Clone)]
pub struct FakeDb {
    name: Arc<str>,
    address: Arc<str>,
    inner: Arc<Mutex<Inner>>,
}

impl FakeDb {
    pub fn new(name: &str, address: &str) -> Self {
        Self {
            name: Arc::from(name),
            address: Arc::from(address),
            inner: Arc::new(Mutex::new(Inner {
                data_directory_empty: false,
                healthy: true,
                leader: false,
                optime: 0,
                maximum_lag: i64::MAX,
                ..Default::default()
            })),
        }
    }

    /// A second handle to the same underlying state, for inspection
    /// after the original has been boxed and moved into `HaCycle`.
    pub fn handle(&self) -> Self {
        self.clone()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.inner.lock().unwrap().healthy = healthy;
    }

    pub fn set_leader(&self, leader: bool) {
        self.inner.lock().unwrap().leader = leader;
    }

    pub fn set_optime(&self, optime: i64) {
        self.inner.lock().unwrap().optime = optime;
    }

    pub fn set_maximum_lag(&self, lag: i64) {
        self.inner.lock().unwrap().maximum_lag = lag;
    }

    pub fn is_leader_now(&self) -> bool {
        self.inner.lock().unwrap().leader
    }

    pub fn promote_calls(&self) -> u32 {
        self.inner.lock().unwrap().promote_calls
    }

    pub fn demote_calls(&self) -> u32 {
        self.inner.lock().unwrap().demote_calls
    }

    pub fn follow_no_leader_calls(&self) -> u32 {
        self.inner.lock().unwrap().follow_no_leader_calls
    }

    pub fn follow_leader_calls(&self) -> u32 {
        self.inner.lock().unwrap().follow_leader_calls
    }

    pub fn slot_count(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }
}

#[async_trait]
impl DbHandler for FakeDb {
    fn name(&self) -> &str {
        &self.name
    }

    fn advertised_connection_string(&self) -> &str {
        &self.address
    }

    fn data_directory_empty(&self) -> bool {
        self.inner.lock().unwrap().data_directory_empty
    }

    fn write_recovery_conf(&self, _leader: &Member) -> Result<(), StateError> {
        Ok(())
    }

    async fn initialize(&mut self) -> Result<(), StateError> {
        Ok(())
    }

    async fn sync_from_leader(&mut self, _leader: &Member) -> Result<bool, StateError> {
        Ok(true)
    }

    async fn start(&mut self, _master: bool) -> Result<bool, StateError> {
        Ok(true)
    }

    async fn stop(&mut self) -> Result<(), StateError> {
        Ok(())
    }

    async fn is_healthy(&mut self) -> bool {
        self.inner.lock().unwrap().healthy
    }

    async fn is_leader(&mut self) -> bool {
        self.inner.lock().unwrap().leader
    }

    async fn last_operation(&mut self) -> i64 {
        self.inner.lock().unwrap().optime
    }

    async fn promote(&mut self) -> Result<bool, StateError> {
        let mut inner = self.inner.lock().unwrap();
        inner.promote_calls += 1;
        inner.leader = true;
        Ok(true)
    }

    async fn demote(&mut self, _leader: &Member) -> Result<(), StateError> {
        let mut inner = self.inner.lock().unwrap();
        inner.demote_calls += 1;
        inner.leader = false;
        Ok(())
    }

    async fn follow_the_leader(&mut self, _leader: &Member) -> Result<bool, StateError> {
        let mut inner = self.inner.lock().unwrap();
        inner.follow_leader_calls += 1;
        inner.leader = false;
        Ok(true)
    }

    async fn follow_no_leader(&mut self) -> Result<bool, StateError> {
        let mut inner = self.inner.lock().unwrap();
        inner.follow_no_leader_calls += 1;
        inner.leader = false;
        Ok(true)
    }

    async fn create_replication_slot(&mut self, member: &Member) -> Result<(), StateError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.slots.contains(&member.hostname) {
            inner.slots.push(member.hostname.clone());
        }
        Ok(())
    }

    /// Candidacy mirrors `PostgresHandler::is_healthiest_node`'s lag
    /// check (spec.md §4.3 rule 2) but against the fake's own scripted
    /// optime instead of a real WAL position, and skips the peer-probe
    /// half since these tests never register more than one fake
    /// candidate against the same KV scope.
    async fn is_healthiest_node(&mut self, kv: &KvClient) -> bool {
        let leader_optime = match kv.last_leader_operation().await {
            Ok(Some(optime)) => optime,
            Ok(None) => return true,
            Err(_) => return false,
        };

        let my_progress = self.inner.lock().unwrap().optime;
        let max_lag = self.inner.lock().unwrap().maximum_lag;
        leader_optime - my_progress <= max_lag
    }
}
