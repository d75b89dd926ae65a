//! Shared state of the config server

use std::sync::Arc;

use dashmap::DashMap;

use crate::model::GroupKey;
use crate::protocol::RuntimeReport;
use crate::storage::ConfigStore;

use super::longpoll::LongPollCoordinator;

#[derive(Clone)]
pub struct ServerState {
    pub store: Arc<dyn ConfigStore>,
    pub coordinator: Arc<LongPollCoordinator>,

    /// Latest runtime report per pool
    pub reports: Arc<DashMap<GroupKey, RuntimeReport>>,
}

impl ServerState {
    pub fn new(store: Arc<dyn ConfigStore>, coordinator: Arc<LongPollCoordinator>) -> Self {
        Self {
            store,
            coordinator,
            reports: Arc::new(DashMap::new()),
        }
    }

    /// Reports ordered by group key
    pub fn reports(&self) -> Vec<RuntimeReport> {
        let mut reports: Vec<RuntimeReport> = self
            .reports
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        reports.sort_by(|a, b| a.group_key.cmp(&b.group_key));
        reports
    }
}
